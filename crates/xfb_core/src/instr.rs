//! Instruction record codec.
//!
//! A record is a fixed-size little-endian block. Byte 0 holds the operation
//! class and byte 1 the opcode; the class selects one of two layouts for the
//! remaining bytes (see `xfb_common::isa::b1` and `xfb_common::isa::mat`).
//! Bytes beyond the layout are written as zero.

use crate::{BlasError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use xfb_common::isa::{OpClass, Opcode, b1, mat};
use xfb_common::mem::{MIN_RECORD_BYTES, NULL_HANDLE};

/// Element type of operand vectors and matrices.
pub type DataType = f32;

/// Type of scalar results (`dot`, `nrm2`, `asum`, index results).
pub type ResDataType = f32;

/// A Level-1 vector record.
///
/// Handles are byte offsets into the operand storage of whoever executes the
/// record; `None` is encoded as `NULL_HANDLE`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct B1Instr {
    pub op: Opcode,
    pub n: u32,
    pub alpha: DataType,
    pub x: Option<u32>,
    pub y: Option<u32>,
    pub x_res: Option<u32>,
    pub y_res: Option<u32>,
    pub res_scalar: ResDataType,
}

/// A Level-2 (`gemv`) or Level-3 (`gemm`) record.
///
/// For `gemv` the `b` operand is the vector `x`, `c` is `y` and `k` is
/// unused. Leading dimensions are in elements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatInstr {
    pub op: Opcode,
    pub trans_a: bool,
    pub trans_b: bool,
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub alpha: DataType,
    pub beta: DataType,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub lda: u32,
    pub ldb: u32,
    pub ldc: u32,
}

/// One decoded instruction record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    B1(B1Instr),
    Mat(MatInstr),
}

fn put_handle(buf: &mut [u8], at: usize, handle: Option<u32>) {
    LittleEndian::write_u32(&mut buf[at..at + 4], handle.unwrap_or(NULL_HANDLE));
}

fn get_handle(buf: &[u8], at: usize) -> Option<u32> {
    match LittleEndian::read_u32(&buf[at..at + 4]) {
        NULL_HANDLE => None,
        h => Some(h),
    }
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    LittleEndian::read_u32(&buf[at..at + 4])
}

fn get_f32(buf: &[u8], at: usize) -> f32 {
    LittleEndian::read_f32(&buf[at..at + 4])
}

impl Instr {
    /// Opcode carried by the record.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::B1(i) => i.op,
            Self::Mat(i) => i.op,
        }
    }

    /// Operation class the record is issued under.
    pub fn class(&self) -> OpClass {
        self.opcode().class()
    }

    /// Writes the record into `buf`, zero-filling every byte the layout does
    /// not use.
    ///
    /// `buf` is one record slot; it must be at least `MIN_RECORD_BYTES` long,
    /// which `FormatParams` guarantees for every accepted geometry.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= MIN_RECORD_BYTES, "record slot too small");
        buf.fill(0);
        match self {
            Self::B1(i) => {
                buf[b1::CLASS] = OpClass::B1 as u8;
                buf[b1::OPCODE] = i.op as u8;
                LittleEndian::write_u32(&mut buf[b1::N..], i.n);
                LittleEndian::write_f32(&mut buf[b1::ALPHA..], i.alpha);
                LittleEndian::write_f32(&mut buf[b1::RES_SCALAR..], i.res_scalar);
                put_handle(buf, b1::X, i.x);
                put_handle(buf, b1::Y, i.y);
                put_handle(buf, b1::X_RES, i.x_res);
                put_handle(buf, b1::Y_RES, i.y_res);
            }
            Self::Mat(i) => {
                buf[mat::CLASS] = i.op.class() as u8;
                buf[mat::OPCODE] = i.op as u8;
                let flags = u16::from(i.trans_a) | (u16::from(i.trans_b) << 1);
                LittleEndian::write_u16(&mut buf[mat::FLAGS..], flags);
                LittleEndian::write_u32(&mut buf[mat::M..], i.m);
                LittleEndian::write_u32(&mut buf[mat::K..], i.k);
                LittleEndian::write_u32(&mut buf[mat::N..], i.n);
                LittleEndian::write_f32(&mut buf[mat::ALPHA..], i.alpha);
                LittleEndian::write_f32(&mut buf[mat::BETA..], i.beta);
                LittleEndian::write_u32(&mut buf[mat::A..], i.a);
                LittleEndian::write_u32(&mut buf[mat::B..], i.b);
                LittleEndian::write_u32(&mut buf[mat::C..], i.c);
                LittleEndian::write_u32(&mut buf[mat::LDA..], i.lda);
                LittleEndian::write_u32(&mut buf[mat::LDB..], i.ldb);
                LittleEndian::write_u32(&mut buf[mat::LDC..], i.ldc);
            }
        }
    }

    /// Reads one record back.
    ///
    /// # Returns
    ///
    /// The decoded record, or `BlasError::Format` for a short slot, an
    /// unknown class or opcode, or an opcode issued under the wrong class.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MIN_RECORD_BYTES {
            return Err(BlasError::Format(format!(
                "record slot of {} bytes is shorter than {MIN_RECORD_BYTES}",
                buf.len()
            )));
        }
        let class = OpClass::from_u8(buf[0])
            .ok_or_else(|| BlasError::Format(format!("unknown op class {:#04x}", buf[0])))?;
        let op = Opcode::from_u8(buf[1])
            .ok_or_else(|| BlasError::Format(format!("unknown opcode {:#04x}", buf[1])))?;
        if op.class() != class {
            return Err(BlasError::Format(format!(
                "opcode {} issued under class {class:?}",
                op.mnemonic()
            )));
        }

        if class == OpClass::B1 {
            return Ok(Self::B1(B1Instr {
                op,
                n: get_u32(buf, b1::N),
                alpha: get_f32(buf, b1::ALPHA),
                res_scalar: get_f32(buf, b1::RES_SCALAR),
                x: get_handle(buf, b1::X),
                y: get_handle(buf, b1::Y),
                x_res: get_handle(buf, b1::X_RES),
                y_res: get_handle(buf, b1::Y_RES),
            }));
        }

        let flags = LittleEndian::read_u16(&buf[mat::FLAGS..]);
        Ok(Self::Mat(MatInstr {
            op,
            trans_a: flags & 1 != 0,
            trans_b: flags & 2 != 0,
            m: get_u32(buf, mat::M),
            k: get_u32(buf, mat::K),
            n: get_u32(buf, mat::N),
            alpha: get_f32(buf, mat::ALPHA),
            beta: get_f32(buf, mat::BETA),
            a: get_u32(buf, mat::A),
            b: get_u32(buf, mat::B),
            c: get_u32(buf, mat::C),
            lda: get_u32(buf, mat::LDA),
            ldb: get_u32(buf, mat::LDB),
            ldc: get_u32(buf, mat::LDC),
        }))
    }
}

struct HandleFmt(Option<u32>);

impl fmt::Display for HandleFmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(h) => write!(f, "{h:#x}"),
            None => f.write_str("null"),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::B1(i) => write!(
                f,
                "{:<5} n={} alpha={} x={} y={} xRes={} yRes={} resScalar={}",
                i.op.mnemonic(),
                i.n,
                i.alpha,
                HandleFmt(i.x),
                HandleFmt(i.y),
                HandleFmt(i.x_res),
                HandleFmt(i.y_res),
                i.res_scalar
            ),
            Self::Mat(i) => write!(
                f,
                "{:<5} {}{} m={} k={} n={} alpha={} beta={} a={:#x} b={:#x} c={:#x} lda={} ldb={} ldc={}",
                i.op.mnemonic(),
                if i.trans_a { 'T' } else { 'N' },
                if i.trans_b { 'T' } else { 'N' },
                i.m,
                i.k,
                i.n,
                i.alpha,
                i.beta,
                i.a,
                i.b,
                i.c,
                i.lda,
                i.ldb,
                i.ldc
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axpy() -> Instr {
        Instr::B1(B1Instr {
            op: Opcode::Axpy,
            n: 17,
            alpha: 2.5,
            x: Some(0),
            y: Some(128),
            x_res: None,
            y_res: Some(256),
            res_scalar: 0.0,
        })
    }

    #[test]
    fn b1_record_bytes_follow_the_layout() {
        let mut buf = [0xAAu8; 64];
        axpy().encode(&mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(buf[1], Opcode::Axpy as u8);
        assert_eq!(&buf[4..8], &17u32.to_le_bytes());
        assert_eq!(&buf[8..12], &2.5f32.to_le_bytes());
        assert_eq!(&buf[24..28], &[0xFF; 4]);
        assert!(buf[32..].iter().all(|&b| b == 0));
        assert_eq!(Instr::decode(&buf).ok(), Some(axpy()));
    }

    #[test]
    fn gemm_record_keeps_transpose_flags() {
        let gemm = Instr::Mat(MatInstr {
            op: Opcode::Gemm,
            trans_a: false,
            trans_b: true,
            m: 64,
            k: 128,
            n: 32,
            alpha: 1.0,
            beta: 0.5,
            a: 0,
            b: 4096,
            c: 8192,
            lda: 128,
            ldb: 128,
            ldc: 32,
        });
        let mut buf = [0u8; 64];
        gemm.encode(&mut buf);
        assert_eq!(buf[0], OpClass::B3 as u8);
        assert_eq!(buf[2], 0b10);
        assert_eq!(Instr::decode(&buf).ok(), Some(gemm));
    }

    #[test]
    fn decode_rejects_foreign_bytes() {
        let mut buf = [0u8; 64];
        assert!(matches!(Instr::decode(&buf), Err(BlasError::Format(_))));
        buf[0] = OpClass::B1 as u8;
        buf[1] = Opcode::Gemm as u8;
        assert!(matches!(Instr::decode(&buf), Err(BlasError::Format(_))));
        assert!(matches!(Instr::decode(&buf[..40]), Err(BlasError::Format(_))));
    }
}
