//! Dynamic filter configuration.
//!
//! A filter block is 45 little-endian `u32` words:
//!
//! ```text
//! [0..12)   four conditions: boundLow, boundHigh, opLow << 4 | opHigh
//! [12]      six column-pair ops, 4 bits each: 1-2 1-3 1-4 2-3 2-4 3-4
//! [13..45)  1024-entry truth table, bit i of the table is entry i
//! ```
//!
//! A row passes when the truth-table entry indexed by its comparison results
//! is set. Condition `c` contributes bit `c` of the index, pair `p`
//! contributes bit `4 + p`.

use bitvec::prelude::*;

/// Bits per comparison opcode.
pub const FILTER_OP_WIDTH: u32 = 4;

/// Words in one encoded filter block.
pub const FILTER_BLOCK_WORDS: usize = 45;

/// Column pairs compared by the six pair ops, in encoding order.
pub const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Comparison applied by a filter condition.
///
/// The `U` variants compare the raw 32-bit values unsigned; the others treat
/// them as two's-complement. `Dc` ("don't care") is always true.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOp {
    #[default]
    Dc = 0,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Gtu,
    Ltu,
    Geu,
    Leu,
}

impl FilterOp {
    /// Evaluates `lhs op rhs`.
    pub fn compare(self, lhs: u32, rhs: u32) -> bool {
        let (sl, sr) = (lhs as i32, rhs as i32);
        match self {
            Self::Dc => true,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Gt => sl > sr,
            Self::Lt => sl < sr,
            Self::Ge => sl >= sr,
            Self::Le => sl <= sr,
            Self::Gtu => lhs > rhs,
            Self::Ltu => lhs < rhs,
            Self::Geu => lhs >= rhs,
            Self::Leu => lhs <= rhs,
        }
    }
}

/// One range condition on a column: `col opLow boundLow && col opHigh boundHigh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterSpec {
    pub op_low: FilterOp,
    pub op_high: FilterOp,
    pub bound_low: u32,
    pub bound_high: u32,
}

impl FilterSpec {
    /// Condition that accepts every value.
    pub const PASS: Self = Self {
        op_low: FilterOp::Dc,
        op_high: FilterOp::Dc,
        bound_low: 0,
        bound_high: 0,
    };

    pub fn new(op_low: FilterOp, bound_low: u32, op_high: FilterOp, bound_high: u32) -> Self {
        Self {
            op_low,
            op_high,
            bound_low,
            bound_high,
        }
    }

    pub fn matches(&self, value: u32) -> bool {
        self.op_low.compare(value, self.bound_low) && self.op_high.compare(value, self.bound_high)
    }

    fn op_word(&self) -> u32 {
        (u32::from(self.op_low as u8) << FILTER_OP_WIDTH) | u32::from(self.op_high as u8)
    }
}

/// 1024-entry lookup table combining condition and pair results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruthTable(BitArray<[u32; 32], Lsb0>);

impl TruthTable {
    /// Entries in the table.
    pub const ENTRIES: usize = 1024;

    /// Table that passes only when every condition and every pair holds,
    /// i.e. the conjunction of all ten inputs.
    pub fn all_pass() -> Self {
        let mut bits = BitArray::ZERO;
        bits.set(Self::ENTRIES - 1, true);
        Self(bits)
    }

    /// Builds a table from a predicate over the 10-bit entry index.
    pub fn from_fn(f: impl Fn(u16) -> bool) -> Self {
        let mut bits = BitArray::<[u32; 32], Lsb0>::ZERO;
        for idx in 0..Self::ENTRIES {
            bits.set(idx, f(idx as u16));
        }
        Self(bits)
    }

    pub fn get(&self, idx: u16) -> bool {
        self.0[usize::from(idx) % Self::ENTRIES]
    }

    pub fn words(&self) -> [u32; 32] {
        self.0.into_inner()
    }
}

impl Default for TruthTable {
    fn default() -> Self {
        Self::all_pass()
    }
}

/// Complete filter for one input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterConfig {
    pub conditions: [FilterSpec; 4],
    pub pair_ops: [FilterOp; 6],
    pub truth: TruthTable,
}

impl FilterConfig {
    /// Filter that lets every row through.
    pub fn pass() -> Self {
        Self {
            conditions: [FilterSpec::PASS; 4],
            pair_ops: [FilterOp::Dc; 6],
            truth: TruthTable::all_pass(),
        }
    }

    /// Encodes the 45-word block.
    pub fn encode(&self) -> [u32; FILTER_BLOCK_WORDS] {
        let mut out = [0u32; FILTER_BLOCK_WORDS];
        for (c, cond) in self.conditions.iter().enumerate() {
            out[3 * c] = cond.bound_low;
            out[3 * c + 1] = cond.bound_high;
            out[3 * c + 2] = cond.op_word();
        }
        out[12] = self
            .pair_ops
            .iter()
            .enumerate()
            .fold(0, |acc, (p, op)| acc | (u32::from(*op as u8) << (FILTER_OP_WIDTH * p as u32)));
        out[13..].copy_from_slice(&self.truth.words());
        out
    }

    /// Truth-table index for a row of the four filtered columns.
    pub fn index(&self, row: &[u32; 4]) -> u16 {
        let conds = self
            .conditions
            .iter()
            .zip(row)
            .enumerate()
            .fold(0u16, |acc, (c, (cond, v))| acc | (u16::from(cond.matches(*v)) << c));
        PAIRS
            .iter()
            .zip(&self.pair_ops)
            .enumerate()
            .fold(conds, |acc, (p, (&(i, j), op))| {
                acc | (u16::from(op.compare(row[i], row[j])) << (4 + p))
            })
    }

    /// Host-side evaluation of the encoded filter.
    pub fn evaluate(&self, row: &[u32; 4]) -> bool {
        self.truth.get(self.index(row))
    }
}
