//! Memory-word geometry of an instruction stream.
//!
//! The accelerator reads `arg_instr_width` records per memory word, so a
//! parameter set is only usable when the records tile the word exactly and a
//! record is large enough for the widest layout.

use crate::{BlasError, Result};
use xfb_common::mem;

/// Validated memory-word geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatParams {
    mem_width_bytes: usize,
    instr_size_bytes: usize,
    arg_instr_width: usize,
}

impl FormatParams {
    /// Builds a parameter set, rejecting any geometry that would produce an
    /// unreadable program.
    ///
    /// # Arguments
    ///
    /// * `mem_width_bytes` - Width of one memory word
    /// * `instr_size_bytes` - Size of one instruction record
    /// * `arg_instr_width` - Records per memory word
    ///
    /// # Returns
    ///
    /// The parameter set, or `BlasError::Format` when
    /// `instr_size_bytes * arg_instr_width != mem_width_bytes`, when the
    /// record is smaller than the widest layout, or when the word does not
    /// hold a whole number of elements.
    pub fn new(
        mem_width_bytes: usize,
        instr_size_bytes: usize,
        arg_instr_width: usize,
    ) -> Result<Self> {
        let tiled = instr_size_bytes.checked_mul(arg_instr_width);
        if tiled != Some(mem_width_bytes) || mem_width_bytes == 0 {
            return Err(BlasError::Format(format!(
                "{instr_size_bytes} byte records x {arg_instr_width} per word \
                 do not tile a {mem_width_bytes} byte memory word"
            )));
        }
        if instr_size_bytes < mem::MIN_RECORD_BYTES {
            return Err(BlasError::Format(format!(
                "{instr_size_bytes} byte records cannot hold a {} byte matrix record",
                mem::MIN_RECORD_BYTES
            )));
        }
        if mem_width_bytes % size_of::<f32>() != 0 {
            return Err(BlasError::Format(format!(
                "{mem_width_bytes} byte memory word does not hold whole elements"
            )));
        }
        Ok(Self {
            mem_width_bytes,
            instr_size_bytes,
            arg_instr_width,
        })
    }

    pub fn mem_width_bytes(&self) -> usize {
        self.mem_width_bytes
    }

    pub fn instr_size_bytes(&self) -> usize {
        self.instr_size_bytes
    }

    pub fn arg_instr_width(&self) -> usize {
        self.arg_instr_width
    }

    /// Elements delivered per memory word.
    pub fn par_entries(&self) -> usize {
        self.mem_width_bytes / size_of::<f32>()
    }

    /// Rounds a byte count up to whole memory words, never below one word.
    pub fn padded_bytes(&self, bytes: usize) -> usize {
        bytes.max(1).div_ceil(self.mem_width_bytes) * self.mem_width_bytes
    }

    /// Bytes occupied by `count` records once padded to whole memory words.
    pub fn stream_bytes(&self, count: usize) -> usize {
        count.div_ceil(self.arg_instr_width) * self.mem_width_bytes
    }
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            mem_width_bytes: mem::MEM_WIDTH_BYTES,
            instr_size_bytes: mem::INSTR_SIZE_BYTES,
            arg_instr_width: mem::ARG_INSTR_WIDTH,
        }
    }
}
