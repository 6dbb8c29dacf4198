//! Range-checked bit fields inside 512-bit memory words.

use crate::{BlasError, Result};
use bitvec::prelude::*;

/// One 512-bit word, bit 0 is the least significant bit of the first byte.
pub type Word512 = BitArray<[u64; 8], Lsb0>;

/// Bytes in one 512-bit word.
pub const WORD_BYTES: usize = 64;

/// A named bit range `[lsb, lsb + width)` inside a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub name: &'static str,
    pub lsb: usize,
    pub width: usize,
}

impl BitRange {
    pub const fn new(name: &'static str, lsb: usize, width: usize) -> Self {
        Self { name, lsb, width }
    }

    /// The range shifted up by `lanes * width` bits, for lane arrays.
    pub const fn lane(self, lanes: usize) -> Self {
        Self {
            name: self.name,
            lsb: self.lsb + lanes * self.width,
            width: self.width,
        }
    }

    fn out_of_range(&self, value: i64, signed: bool) -> BlasError {
        let (min, max) = match (signed, self.width) {
            (true, 64) => (i64::MIN, i64::MAX),
            (false, w) if w >= 63 => (0, i64::MAX),
            (true, w) => (-(1i64 << (w - 1)), (1i64 << (w - 1)) - 1),
            (false, w) => (0, (1i64 << w) - 1),
        };
        BlasError::Range {
            field: self.name,
            value,
            min,
            max,
        }
    }

    fn slot<'a>(&self, word: &'a mut Word512) -> &'a mut BitSlice<u64, Lsb0> {
        debug_assert!(self.width >= 1 && self.width <= 64);
        debug_assert!(self.lsb + self.width <= 512, "{} leaves the word", self.name);
        &mut word[self.lsb..self.lsb + self.width]
    }

    /// Stores an unsigned value, failing when it needs more than `width`
    /// bits. Bits outside the range are never touched.
    pub fn store(&self, word: &mut Word512, value: u64) -> Result<()> {
        if self.width < 64 && value >> self.width != 0 {
            return Err(self.out_of_range(i64::try_from(value).unwrap_or(i64::MAX), false));
        }
        self.slot(word).store_le::<u64>(value);
        Ok(())
    }

    /// Stores a two's-complement value, failing outside
    /// `-2^(width-1) ..= 2^(width-1) - 1`.
    pub fn store_signed(&self, word: &mut Word512, value: i64) -> Result<()> {
        let half = 1i64 << (self.width - 1);
        if self.width < 64 && !(-half..half).contains(&value) {
            return Err(self.out_of_range(value, true));
        }
        let mask = if self.width == 64 { u64::MAX } else { (1u64 << self.width) - 1 };
        self.slot(word).store_le::<u64>(value as u64 & mask);
        Ok(())
    }

    pub fn load(&self, word: &Word512) -> u64 {
        word[self.lsb..self.lsb + self.width].load_le::<u64>()
    }

    pub fn load_signed(&self, word: &Word512) -> i64 {
        let raw = self.load(word);
        let shift = 64 - self.width as u32;
        ((raw << shift) as i64) >> shift
    }
}

/// Serialises a word little-endian.
pub fn word_to_bytes(word: &Word512) -> [u8; WORD_BYTES] {
    let mut out = [0u8; WORD_BYTES];
    for (chunk, limb) in out.chunks_exact_mut(8).zip(word.as_raw_slice()) {
        chunk.copy_from_slice(&limb.to_le_bytes());
    }
    out
}

/// Inverse of [`word_to_bytes`].
pub fn word_from_bytes(bytes: &[u8; WORD_BYTES]) -> Word512 {
    let mut limbs = [0u64; 8];
    for (limb, chunk) in limbs.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *limb = u64::from_le_bytes(raw);
    }
    Word512::new(limbs)
}

/// Packs 32-bit values into consecutive words, 16 per word.
pub fn pack_u32_words(values: &[u32], words: &mut [Word512]) {
    debug_assert!(values.len() <= words.len() * 16);
    for (i, &v) in values.iter().enumerate() {
        let lsb = (i % 16) * 32;
        words[i / 16][lsb..lsb + 32].store_le::<u32>(v);
    }
}
