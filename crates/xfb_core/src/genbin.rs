//! `GenBin` instruction encoder.
//!
//! Builds a [`Program`] one vector instruction at a time. Operand data is
//! copied into the owned arena at the moment the instruction is added, so the
//! caller's slices may be dropped or reused immediately afterwards.

use crate::format::FormatParams;
use crate::instr::{B1Instr, DataType, Instr, ResDataType};
use crate::program::Program;
use crate::{BlasError, Result};
use std::fmt;
use std::io::Write;
use tracing::debug;
use xfb_common::isa::{OpClass, Opcode};

/// How one operand slot of an instruction is filled.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// Slot unused; encoded as the null handle.
    Absent,
    /// Fresh operand data, copied into the arena.
    Data(&'a [DataType]),
    /// An operand registered by an earlier instruction.
    Handle(u32),
}

/// Handles assigned to the four operand slots of an added instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotHandles {
    pub x: Option<u32>,
    pub y: Option<u32>,
    pub x_res: Option<u32>,
    pub y_res: Option<u32>,
}

/// A vector instruction with its operands resolved to owned copies.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedB1 {
    pub op: Opcode,
    pub n: u32,
    pub alpha: DataType,
    pub x: Option<Vec<DataType>>,
    pub y: Option<Vec<DataType>>,
    pub x_res: Option<Vec<DataType>>,
    pub y_res: Option<Vec<DataType>>,
    pub res_scalar: ResDataType,
}

/// Instruction encoder producing a binary program.
#[derive(Debug, Clone, PartialEq)]
pub struct GenBin {
    program: Program,
}

impl GenBin {
    pub fn new(params: FormatParams) -> Self {
        Self {
            program: Program::new(params),
        }
    }

    /// Wraps a program read back from disk so it can be decoded or extended.
    pub fn from_program(program: Program) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn into_program(self) -> Program {
        self.program
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.program.instrs
    }

    fn register(&mut self, n: u32, operand: Operand<'_>) -> Result<Option<u32>> {
        let n = n as usize;
        match operand {
            Operand::Absent => Ok(None),
            Operand::Data(data) => {
                if data.len() != n {
                    return Err(BlasError::SizeMismatch {
                        expected: n,
                        actual: data.len(),
                    });
                }
                self.program.arena.push(data).map(Some)
            }
            Operand::Handle(h) => match self.program.arena.region_len(h) {
                None => Err(BlasError::Handle {
                    handle: h,
                    reason: "not registered by an earlier instruction",
                }),
                Some(len) if len != n => Err(BlasError::SizeMismatch {
                    expected: n,
                    actual: len,
                }),
                Some(_) => Ok(Some(h)),
            },
        }
    }

    /// Appends one Level-1 instruction.
    ///
    /// # Arguments
    ///
    /// * `op_name` - Mnemonic, matched without regard to ASCII case
    /// * `n` - Element count of every present operand (zero is allowed)
    /// * `alpha` - Scalar multiplier for `axpy` and `scal`
    /// * `x`, `y` - Input operands
    /// * `x_res`, `y_res` - Expected output operands
    /// * `res_scalar` - Expected scalar result
    ///
    /// # Returns
    ///
    /// The handles assigned to each slot, or `InvalidOp` for a mnemonic
    /// outside the vector instruction set, `SizeMismatch` for an operand of
    /// the wrong length and `Handle` for a handle nothing registered. On error
    /// the program is left unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn add_b1_instr(
        &mut self,
        op_name: &str,
        n: u32,
        alpha: DataType,
        x: Operand<'_>,
        y: Operand<'_>,
        x_res: Operand<'_>,
        y_res: Operand<'_>,
        res_scalar: ResDataType,
    ) -> Result<SlotHandles> {
        let op = Opcode::from_mnemonic(op_name)
            .filter(|op| op.class() == OpClass::B1)
            .ok_or_else(|| BlasError::InvalidOp(op_name.to_string()))?;

        let mark = self.program.arena.len_bytes();
        let mut register_all = || -> Result<SlotHandles> {
            Ok(SlotHandles {
                x: self.register(n, x)?,
                y: self.register(n, y)?,
                x_res: self.register(n, x_res)?,
                y_res: self.register(n, y_res)?,
            })
        };
        let slots = match register_all() {
            Ok(slots) => slots,
            Err(e) => {
                self.program.arena.truncate(mark);
                return Err(e);
            }
        };
        self.program.instrs.push(Instr::B1(B1Instr {
            op,
            n,
            alpha,
            x: slots.x,
            y: slots.y,
            x_res: slots.x_res,
            y_res: slots.y_res,
            res_scalar,
        }));
        debug!(op = op.mnemonic(), n, ?slots, "added vector instruction");
        Ok(slots)
    }

    /// Resolves the operands of a vector instruction to fresh copies.
    ///
    /// # Returns
    ///
    /// The decoded instruction, `InvalidOp` for a matrix record, or `Handle`
    /// when a present handle is misaligned or outside the arena.
    pub fn decode_b1_instr(&self, instr: &Instr) -> Result<DecodedB1> {
        let Instr::B1(i) = instr else {
            return Err(BlasError::InvalidOp(format!(
                "{} is not a vector instruction",
                instr.opcode().mnemonic()
            )));
        };
        let arena = &self.program.arena;
        let fetch = |h: Option<u32>| h.map(|h| arena.read(h, i.n as usize)).transpose();
        Ok(DecodedB1 {
            op: i.op,
            n: i.n,
            alpha: i.alpha,
            x: fetch(i.x)?,
            y: fetch(i.y)?,
            x_res: fetch(i.x_res)?,
            y_res: fetch(i.y_res)?,
            res_scalar: i.res_scalar,
        })
    }

    /// Decodes every vector instruction of the program in order.
    pub fn decode_all(&self) -> Result<Vec<DecodedB1>> {
        self.program
            .instrs
            .iter()
            .map(|i| self.decode_b1_instr(i))
            .collect()
    }

    /// Writes a human-readable dump, one line per record.
    pub fn print_program<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        write!(out, "{self}")
    }
}

impl fmt::Display for GenBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.program.params;
        writeln!(
            f,
            "# memWidth={} instrSize={} argInstrWidth={} parEntries={} instrs={} arenaBytes={}",
            p.mem_width_bytes(),
            p.instr_size_bytes(),
            p.arg_instr_width(),
            p.par_entries(),
            self.program.instrs.len(),
            self.program.arena.len_bytes()
        )?;
        for (idx, instr) in self.program.instrs.iter().enumerate() {
            writeln!(f, "[{idx:4}] {instr}")?;
        }
        Ok(())
    }
}
