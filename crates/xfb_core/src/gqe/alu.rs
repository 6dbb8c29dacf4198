//! Dynamic ALU expressions.
//!
//! An expression combines up to four input streams. Each stream first goes
//! through its pre-op together with its constant, then is merged into the
//! accumulator by its merge-op. Streams whose pre-op is `Nop` are skipped.
//!
//! Encoded layout inside one 512-bit word:
//!
//! ```text
//! bits [32*i, 32*i+32)      constant c(i+1), i in 0..4
//! bits [128+14*i, +7)       pre-op of stream i
//! bits [135+14*i, +7)       merge-op of stream i
//! bit  288                  enable
//! ```

use crate::bit_utils::{BitRange, Word512};
use crate::{BlasError, Result};

/// Bits per ALU opcode.
pub const ALU_OP_WIDTH: usize = 7;

/// Bit index of the expression enable flag.
pub const ALU_ENABLE_BIT: usize = 288;

const CONSTANT: BitRange = BitRange::new("alu constant", 0, 32);
const PRE_OP: BitRange = BitRange::new("alu pre-op", 128, ALU_OP_WIDTH);
const MERGE_OP: BitRange = BitRange::new("alu merge-op", 128 + ALU_OP_WIDTH, ALU_OP_WIDTH);
const STREAM_STRIDE: usize = 2 * ALU_OP_WIDTH;

/// Operation applied by a pre-op or merge-op slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AluOp {
    #[default]
    Nop = 0,
    Pass = 1,
    Add = 2,
    Sub = 3,
    /// Reversed subtraction, `rhs - lhs`.
    RSub = 4,
    Mul = 5,
    Min = 6,
    Max = 7,
}

impl AluOp {
    /// Decodes a raw opcode field.
    ///
    /// # Returns
    ///
    /// The operation, `BlasError::Range` for a value wider than the 7-bit
    /// field, or `BlasError::InvalidValue` for an unassigned code.
    pub fn from_raw(raw: u8) -> Result<Self> {
        if usize::from(raw) >> ALU_OP_WIDTH != 0 {
            return Err(BlasError::Range {
                field: "alu opcode",
                value: i64::from(raw),
                min: 0,
                max: (1 << ALU_OP_WIDTH) - 1,
            });
        }
        Ok(match raw {
            0 => Self::Nop,
            1 => Self::Pass,
            2 => Self::Add,
            3 => Self::Sub,
            4 => Self::RSub,
            5 => Self::Mul,
            6 => Self::Min,
            7 => Self::Max,
            other => return Err(BlasError::InvalidValue(format!("unassigned alu opcode {other}"))),
        })
    }

    /// `lhs op rhs` with 64-bit wrapping arithmetic.
    pub fn apply(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            Self::Nop => lhs,
            Self::Pass => rhs,
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::RSub => rhs.wrapping_sub(lhs),
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::Min => lhs.min(rhs),
            Self::Max => lhs.max(rhs),
        }
    }
}

/// Raw opcode pair for one stream.
///
/// Held as raw codes so that configurations read from elsewhere can be
/// re-encoded; out-of-range codes are reported when the word is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AluOpPair {
    pub pre: u8,
    pub merge: u8,
}

impl AluOpPair {
    pub fn new(pre: AluOp, merge: AluOp) -> Self {
        Self {
            pre: pre as u8,
            merge: merge as u8,
        }
    }
}

/// One ALU expression over four input streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AluExpr {
    pub constants: [u32; 4],
    pub ops: [AluOpPair; 4],
}

impl AluExpr {
    /// `stream[a] * stream[b]`, the shape of a revenue expression.
    pub fn product(a: usize, b: usize) -> Self {
        let mut expr = Self::default();
        expr.ops[a] = AluOpPair::new(AluOp::Pass, AluOp::Pass);
        expr.ops[b] = AluOpPair::new(AluOp::Pass, AluOp::Mul);
        expr
    }

    /// Writes the expression into `word`, leaving bits above the enable flag
    /// untouched.
    pub fn encode_into(&self, word: &mut Word512) -> Result<()> {
        for (i, c) in self.constants.iter().enumerate() {
            CONSTANT.lane(i).store(word, u64::from(*c))?;
        }
        for (i, pair) in self.ops.iter().enumerate() {
            let shift = i * STREAM_STRIDE;
            BitRange { lsb: PRE_OP.lsb + shift, ..PRE_OP }.store(word, u64::from(pair.pre))?;
            BitRange { lsb: MERGE_OP.lsb + shift, ..MERGE_OP }.store(word, u64::from(pair.merge))?;
        }
        word.set(ALU_ENABLE_BIT, true);
        Ok(())
    }

    /// Host reference for the encoded expression.
    ///
    /// Stream values are signed 32-bit columns; constants are applied with
    /// the same sign interpretation.
    pub fn evaluate(&self, streams: [u32; 4]) -> Result<i64> {
        let mut acc = 0i64;
        for ((pair, value), constant) in self.ops.iter().zip(streams).zip(self.constants) {
            let pre = AluOp::from_raw(pair.pre)?;
            if pre == AluOp::Nop {
                continue;
            }
            let value = i64::from(value as i32);
            let v = match pre {
                AluOp::Pass => value,
                op => op.apply(value, i64::from(constant as i32)),
            };
            acc = AluOp::from_raw(pair.merge)?.apply(acc, v);
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_layout_and_value() {
        let expr = AluExpr::product(0, 1);
        let mut word = Word512::ZERO;
        expr.encode_into(&mut word).unwrap();
        assert_eq!(PRE_OP.load(&word), AluOp::Pass as u64);
        assert_eq!(MERGE_OP.load(&word), AluOp::Pass as u64);
        assert_eq!(BitRange::new("m", 128 + 14 + 7, 7).load(&word), AluOp::Mul as u64);
        assert!(word[ALU_ENABLE_BIT]);
        assert!(!word[ALU_ENABLE_BIT + 1]);
        assert_eq!(expr.evaluate([900, 6, 1, 1]).unwrap(), 5400);
    }

    #[test]
    fn constants_feed_pre_ops() {
        let mut expr = AluExpr::default();
        expr.constants[0] = 100;
        expr.ops[0] = AluOpPair::new(AluOp::RSub, AluOp::Pass);
        expr.constants[1] = 2;
        expr.ops[1] = AluOpPair::new(AluOp::Mul, AluOp::Add);
        assert_eq!(expr.evaluate([30, 5, 0, 0]).unwrap(), 70 + 10);
    }

    #[test]
    fn wide_opcodes_are_rejected() {
        let mut expr = AluExpr::default();
        expr.ops[2].merge = 128;
        let mut word = Word512::ZERO;
        assert!(matches!(expr.encode_into(&mut word), Err(BlasError::Range { value: 128, .. })));
        assert!(matches!(AluOp::from_raw(200), Err(BlasError::Range { .. })));
        assert!(matches!(AluOp::from_raw(9), Err(BlasError::InvalidValue(_))));
    }
}
