//! Software compute unit for matrix instructions.
//!
//! Consumes the same instruction stream the host would send to the engine:
//! each record is decoded from bytes, its operands are located in the kernel
//! instance's device memory by byte offset, and the result is written back
//! in place. Arithmetic is carried out in `f64` and converted back to the
//! configured element type on store.

use crate::format::FormatParams;
use crate::instr::{Instr, MatInstr};
use crate::program::decode_stream;
use crate::{BlasError, Result};
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;
use xfb_common::isa::Opcode;

/// Element type the engine was built for (`GEMX_dataType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Short,
    Int,
    Float,
}

impl ElemType {
    /// Parses the configuration spelling of a data type.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "short" | "int16_t" => Some(Self::Short),
            "int" | "int32_t" => Some(Self::Int),
            "float" => Some(Self::Float),
            _ => None,
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            Self::Short => 2,
            Self::Int | Self::Float => 4,
        }
    }

    fn load(self, bytes: &[u8]) -> f64 {
        match self {
            Self::Short => f64::from(LittleEndian::read_i16(bytes)),
            Self::Int => f64::from(LittleEndian::read_i32(bytes)),
            Self::Float => f64::from(LittleEndian::read_f32(bytes)),
        }
    }

    fn store(self, bytes: &mut [u8], value: f64) {
        match self {
            Self::Short => LittleEndian::write_i16(bytes, value.round() as i16),
            Self::Int => LittleEndian::write_i32(bytes, value.round() as i32),
            Self::Float => LittleEndian::write_f32(bytes, value as f32),
        }
    }
}

/// Row-major view of a matrix operand inside device memory.
struct MatRef {
    base: usize,
    rows: usize,
    cols: usize,
    ld: usize,
}

/// Decodes and executes instruction streams for one kernel instance.
#[derive(Debug, Clone, Copy)]
pub struct KernelVm {
    pub params: FormatParams,
    pub elem: ElemType,
}

impl KernelVm {
    pub fn new(params: FormatParams, elem: ElemType) -> Self {
        Self { params, elem }
    }

    /// Executes the first `count` records of `stream` against `mem`.
    ///
    /// # Returns
    ///
    /// The executed records in order, or `BlasError::Exec` for an
    /// undecodable record, a record the engine does not run, or an operand
    /// that leaves device memory. Records before the failing one have
    /// already been applied.
    pub fn execute_stream(&self, stream: &[u8], count: usize, mem: &mut [u8]) -> Result<Vec<Instr>> {
        let instrs = decode_stream(&self.params, stream, count)
            .map_err(|e| BlasError::Exec(format!("undecodable instruction stream: {e}")))?;
        for instr in &instrs {
            self.execute(instr, mem)?;
        }
        Ok(instrs)
    }

    /// Executes a single decoded record.
    pub fn execute(&self, instr: &Instr, mem: &mut [u8]) -> Result<()> {
        let Instr::Mat(i) = instr else {
            return Err(BlasError::Exec(format!(
                "{} records are not executed by the matrix engine",
                instr.opcode().mnemonic()
            )));
        };
        if i.trans_a || i.trans_b {
            return Err(BlasError::Exec("transposed operands are not executed".into()));
        }
        debug!(%instr, "executing");
        match i.op {
            Opcode::Gemm => self.gemm(i, mem),
            Opcode::Gemv => self.gemv(i, mem),
            op => Err(BlasError::Exec(format!("unexpected opcode {}", op.mnemonic()))),
        }
    }

    fn view(&self, name: &str, base: u32, rows: u32, cols: u32, ld: u32, mem_len: usize) -> Result<MatRef> {
        let (rows, cols, ld) = (rows as usize, cols as usize, ld as usize);
        if cols > ld {
            return Err(BlasError::Exec(format!("{name}: {cols} columns exceed leading dimension {ld}")));
        }
        let base = base as usize;
        let span = rows
            .checked_sub(1)
            .map_or(Some(0), |r| r.checked_mul(ld).and_then(|v| v.checked_add(cols)))
            .and_then(|elems| elems.checked_mul(self.elem.size()))
            .and_then(|bytes| bytes.checked_add(base));
        match span {
            Some(end) if end <= mem_len => Ok(MatRef { base, rows, cols, ld }),
            _ => Err(BlasError::Exec(format!(
                "{name}: {rows}x{cols} operand at {base:#x} leaves device memory"
            ))),
        }
    }

    fn read(&self, mem: &[u8], m: &MatRef) -> Vec<f64> {
        let size = self.elem.size();
        let mut out = Vec::with_capacity(m.rows * m.cols);
        for r in 0..m.rows {
            for c in 0..m.cols {
                let at = m.base + (r * m.ld + c) * size;
                out.push(self.elem.load(&mem[at..at + size]));
            }
        }
        out
    }

    fn gemm(&self, i: &MatInstr, mem: &mut [u8]) -> Result<()> {
        let len = mem.len();
        let a = self.view("A", i.a, i.m, i.k, i.lda, len)?;
        let b = self.view("B", i.b, i.k, i.n, i.ldb, len)?;
        let c = self.view("C", i.c, i.m, i.n, i.ldc, len)?;
        let (av, bv) = (self.read(mem, &a), self.read(mem, &b));
        let (m, k, n) = (a.rows, a.cols, b.cols);
        let size = self.elem.size();
        for r in 0..m {
            for col in 0..n {
                let acc: f64 = (0..k).map(|p| av[r * k + p] * bv[p * n + col]).sum();
                let at = c.base + (r * c.ld + col) * size;
                let slot = &mut mem[at..at + size];
                let old = self.elem.load(slot);
                self.elem
                    .store(slot, f64::from(i.alpha) * acc + f64::from(i.beta) * old);
            }
        }
        Ok(())
    }

    fn gemv(&self, i: &MatInstr, mem: &mut [u8]) -> Result<()> {
        let len = mem.len();
        let a = self.view("A", i.a, i.m, i.n, i.lda, len)?;
        let x = self.view("x", i.b, 1, i.n, i.n, len)?;
        let y = self.view("y", i.c, 1, i.m, i.m, len)?;
        let (av, xv) = (self.read(mem, &a), self.read(mem, &x));
        let (m, n) = (a.rows, a.cols);
        let size = self.elem.size();
        for r in 0..m {
            let acc: f64 = (0..n).map(|p| av[r * n + p] * xv[p]).sum();
            let at = y.base + r * size;
            let slot = &mut mem[at..at + size];
            let old = self.elem.load(slot);
            self.elem
                .store(slot, f64::from(i.alpha) * acc + f64::from(i.beta) * old);
        }
        Ok(())
    }
}
