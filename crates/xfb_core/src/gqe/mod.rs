//! GQE configuration block builder.
//!
//! The block is nine 512-bit words:
//!
//! ```text
//! word 0     control: flags, engine parameter, key columns, write mask,
//!            five shuffle tables
//! word 1, 2  ALU expressions for the two evaluation slots
//! word 3..6  filter block for table A (45 x u32)
//! word 6..9  filter block for table B
//! ```
//!
//! Every field goes through a range-checked [`BitRange`]; a value that does
//! not fit aborts the build with `BlasError::Range` before any byte is
//! produced.

pub mod alu;
pub mod filter;

use crate::bit_utils::{BitRange, WORD_BYTES, Word512, pack_u32_words, word_to_bytes};
use crate::{BlasError, Result};
use alu::AluExpr;
use filter::{FilterConfig, FilterOp, FilterSpec};
use tracing::debug;

/// Words in a configuration block.
pub const CONFIG_WORDS: usize = 9;

/// Lanes in a column-id or shuffle table.
pub const LANES: usize = 8;

/// Source columns visible to each shuffle stage (1a, 1b, 2, 3, 4).
///
/// Stage 2 selects from the merged output of both join sides and stage 3
/// additionally sees the ALU result column.
pub const SHUFFLE_SOURCES: [usize; 5] = [8, 8, 16, 9, 8];

const JOIN_ON: BitRange = BitRange::new("join enable", 0, 1);
const AGGREGATE: BitRange = BitRange::new("aggregate enable", 1, 1);
const DUAL_KEY: BitRange = BitRange::new("dual key", 2, 1);
const JOIN_MODE: BitRange = BitRange::new("hash join mode", 3, 3);
const ENGINE_PARAM: BitRange = BitRange::new("engine parameter", 8, 32);
const KEY_COLS_A: BitRange = BitRange::new("key_cols_a", 56, 8);
const KEY_COLS_B: BitRange = BitRange::new("key_cols_b", 120, 8);
const WRITE_MASK: BitRange = BitRange::new("write_mask", 184, 8);
const SHUFFLE_BASE: usize = 192;

const SHUFFLE_NAMES: [&str; 5] = ["shuffle 1a", "shuffle 1b", "shuffle 2", "shuffle 3", "shuffle 4"];

/// One 8-lane shuffle table; `-1` marks an unused lane.
pub type ShuffleMap = [i8; LANES];

/// Shuffle table routing every column to itself.
pub const IDENTITY_SHUFFLE: ShuffleMap = [0, 1, 2, 3, 4, 5, 6, 7];

/// Hash-join behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMode {
    /// Join stage bypassed.
    #[default]
    Off,
    Normal,
    Semi,
    Anti,
}

impl JoinMode {
    fn enabled(self) -> bool {
        self != Self::Off
    }

    fn code(self) -> u64 {
        match self {
            Self::Off | Self::Normal => 0,
            Self::Semi => 1,
            Self::Anti => 2,
        }
    }
}

/// Everything the engine needs to know about one query pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryShape {
    pub join: JoinMode,
    pub aggregate: bool,
    pub dual_key: bool,
    /// Engine tuning parameter (bits 8..40 of the control word).
    pub engine_param: u32,
    /// Column ids read from table A, `-1` for unused lanes.
    pub key_cols_a: [i8; LANES],
    /// Column ids read from table B, `-1` for unused lanes.
    pub key_cols_b: [i8; LANES],
    /// Bit `i` enables write-out of result column `i`.
    pub write_mask: u8,
    pub alu: [Option<AluExpr>; 2],
    pub filter_a: FilterConfig,
    pub filter_b: FilterConfig,
    /// Shuffle tables 1a, 1b, 2, 3 and 4.
    pub shuffles: [ShuffleMap; 5],
}

impl Default for QueryShape {
    fn default() -> Self {
        pass_through_shape()
    }
}

/// The nine encoded words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigBlock {
    pub words: [Word512; CONFIG_WORDS],
}

impl ConfigBlock {
    /// Serialises the block little-endian, 576 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(word_to_bytes).collect()
    }

    /// Raw filter block stored in words `first..first + 3`.
    pub fn filter_words(&self, table_b: bool) -> [u32; filter::FILTER_BLOCK_WORDS] {
        let first = if table_b { 6 } else { 3 };
        let mut out = [0u32; filter::FILTER_BLOCK_WORDS];
        for (i, v) in out.iter_mut().enumerate() {
            *v = BitRange::new("u32", (i % 16) * 32, 32).load(&self.words[first + i / 16]) as u32;
        }
        out
    }
}

fn check_lanes(name: &'static str, lanes: &[i8; LANES], sources: usize) -> Result<()> {
    match lanes.iter().find(|&&c| c < -1 || c as isize >= sources as isize) {
        Some(&bad) => Err(BlasError::Range {
            field: name,
            value: i64::from(bad),
            min: -1,
            max: sources as i64 - 1,
        }),
        None => Ok(()),
    }
}

fn store_lanes(word: &mut Word512, field: BitRange, lanes: &[i8; LANES]) -> Result<()> {
    for (c, &v) in lanes.iter().enumerate() {
        field.lane(c).store_signed(word, i64::from(v))?;
    }
    Ok(())
}

/// Encodes a query shape into its configuration block.
///
/// # Returns
///
/// The block, or `BlasError::Range` when a column id is outside `-1..=7`, a
/// shuffle lane names a column its stage cannot see, or an ALU opcode does
/// not fit its 7-bit field.
pub fn build_config(shape: &QueryShape) -> Result<ConfigBlock> {
    check_lanes(KEY_COLS_A.name, &shape.key_cols_a, LANES)?;
    check_lanes(KEY_COLS_B.name, &shape.key_cols_b, LANES)?;
    for ((name, map), sources) in SHUFFLE_NAMES.into_iter().zip(&shape.shuffles).zip(SHUFFLE_SOURCES) {
        check_lanes(name, map, sources)?;
    }

    let mut words = [Word512::ZERO; CONFIG_WORDS];
    let ctrl = &mut words[0];
    JOIN_ON.store(ctrl, u64::from(shape.join.enabled()))?;
    AGGREGATE.store(ctrl, u64::from(shape.aggregate))?;
    DUAL_KEY.store(ctrl, u64::from(shape.dual_key))?;
    JOIN_MODE.store(ctrl, shape.join.code())?;
    ENGINE_PARAM.store(ctrl, u64::from(shape.engine_param))?;
    store_lanes(ctrl, KEY_COLS_A, &shape.key_cols_a)?;
    store_lanes(ctrl, KEY_COLS_B, &shape.key_cols_b)?;
    WRITE_MASK.store(ctrl, u64::from(shape.write_mask))?;
    for (stage, (name, map)) in SHUFFLE_NAMES.into_iter().zip(&shape.shuffles).enumerate() {
        let field = BitRange::new(name, SHUFFLE_BASE + stage * LANES * 8, 8);
        store_lanes(ctrl, field, map)?;
    }

    for (slot, expr) in shape.alu.iter().enumerate() {
        if let Some(expr) = expr {
            expr.encode_into(&mut words[1 + slot])?;
        }
    }

    pack_u32_words(&shape.filter_a.encode(), &mut words[3..6]);
    pack_u32_words(&shape.filter_b.encode(), &mut words[6..9]);

    debug!(
        join = ?shape.join,
        aggregate = shape.aggregate,
        bytes = CONFIG_WORDS * WORD_BYTES,
        "built gqe configuration"
    );
    Ok(ConfigBlock { words })
}

/// Configuration that forwards table A unchanged.
pub fn pass_through_shape() -> QueryShape {
    QueryShape {
        join: JoinMode::Off,
        aggregate: false,
        dual_key: false,
        engine_param: 32,
        key_cols_a: IDENTITY_SHUFFLE,
        key_cols_b: [-1; LANES],
        write_mask: 0xFF,
        alu: [None, None],
        filter_a: FilterConfig::pass(),
        filter_b: FilterConfig::pass(),
        shuffles: [IDENTITY_SHUFFLE; 5],
    }
}

/// Column order of the lineitem table consumed by [`q6_shape`].
pub const Q6_COLUMNS: [&str; 4] = ["l_extendedprice", "l_discount", "l_shipdate", "l_quantity"];

/// TPC-H Q6: filter lineitem and sum `l_extendedprice * l_discount`.
///
/// Filter conditions apply to the columns of [`Q6_COLUMNS`] in order:
/// `5 <= l_discount <= 7`, `19940101 <= l_shipdate < 19950101` and
/// `l_quantity < 24`. Discounts are stored in hundredths.
pub fn q6_shape() -> QueryShape {
    let mut filter_a = FilterConfig::pass();
    filter_a.conditions = [
        FilterSpec::PASS,
        FilterSpec::new(FilterOp::Ge, 5, FilterOp::Le, 7),
        FilterSpec::new(FilterOp::Ge, 19940101, FilterOp::Lt, 19950101),
        FilterSpec::new(FilterOp::Dc, 0, FilterOp::Lt, 24),
    ];
    QueryShape {
        join: JoinMode::Off,
        aggregate: true,
        dual_key: false,
        engine_param: 32,
        key_cols_a: [0, 1, 2, 3, -1, -1, -1, -1],
        key_cols_b: [-1; LANES],
        write_mask: 1,
        alu: [Some(AluExpr::product(0, 1)), None],
        filter_a,
        filter_b: FilterConfig::pass(),
        shuffles: [IDENTITY_SHUFFLE; 5],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_control_word() {
        let block = build_config(&pass_through_shape()).unwrap();
        let ctrl = &block.words[0];
        assert_eq!(JOIN_ON.load(ctrl), 0);
        assert_eq!(ENGINE_PARAM.load(ctrl), 32);
        assert_eq!(KEY_COLS_B.lane(7).load_signed(ctrl), -1);
        assert_eq!(WRITE_MASK.load(ctrl), 0xFF);
        assert_eq!(block.to_bytes().len(), 576);
        assert_eq!(block.filter_words(false), FilterConfig::pass().encode());
        assert!(block.words[1].not_any());
    }

    #[test]
    fn q6_fields() {
        let shape = q6_shape();
        let block = build_config(&shape).unwrap();
        let ctrl = &block.words[0];
        assert_eq!(AGGREGATE.load(ctrl), 1);
        assert_eq!(KEY_COLS_A.lane(3).load_signed(ctrl), 3);
        assert_eq!(KEY_COLS_A.lane(4).load_signed(ctrl), -1);
        assert_eq!(BitRange::new("s3", SHUFFLE_BASE + 3 * 64 + 8 * 5, 8).load(ctrl), 5);
        assert!(block.words[1][alu::ALU_ENABLE_BIT]);
        assert!(block.words[2].not_any());

        let words = block.filter_words(false);
        assert_eq!(&words[3..6], &[5, 7, ((FilterOp::Ge as u32) << 4) | FilterOp::Le as u32]);
        assert_eq!(words[44], 1 << 31);

        let row = [1000, 6, 19940615, 20];
        assert!(shape.filter_a.evaluate(&row));
        assert!(!shape.filter_a.evaluate(&[1000, 6, 19950101, 20]));
        assert!(!shape.filter_a.evaluate(&[1000, 8, 19940615, 20]));
        let alu = shape.alu[0].unwrap();
        assert_eq!(alu.evaluate(row).unwrap(), 6000);
    }

    #[test]
    fn join_modes_and_lane_limits() {
        let mut shape = pass_through_shape();
        shape.join = JoinMode::Anti;
        shape.shuffles[2] = [0, 1, 2, 6, 7, 8, 9, 10];
        shape.shuffles[3][0] = 8;
        let block = build_config(&shape).unwrap();
        assert_eq!(JOIN_ON.load(&block.words[0]), 1);
        assert_eq!(JOIN_MODE.load(&block.words[0]), 2);

        shape.shuffles[0][1] = 8;
        assert!(matches!(
            build_config(&shape),
            Err(BlasError::Range { field: "shuffle 1a", value: 8, max: 7, .. })
        ));

        let mut shape = pass_through_shape();
        shape.key_cols_a[0] = -2;
        assert!(matches!(build_config(&shape), Err(BlasError::Range { field: "key_cols_a", .. })));
    }
}
