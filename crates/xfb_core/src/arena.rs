//! Operand arena.
//!
//! Operands are stored back to back, each region padded with zeros to a
//! whole number of memory words (one word minimum, so an empty operand still
//! gets a distinct handle). A handle is the byte offset of its region.

use crate::instr::DataType;
use crate::{BlasError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use xfb_common::mem::NULL_HANDLE;

const ELEM_BYTES: usize = size_of::<DataType>();

/// Owned operand storage addressed by byte-offset handles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperandArena {
    mem_width_bytes: usize,
    bytes: Vec<u8>,
    /// Element count of every registered region, keyed by handle.
    regions: BTreeMap<u32, usize>,
}

impl OperandArena {
    pub fn new(mem_width_bytes: usize) -> Self {
        Self {
            mem_width_bytes,
            bytes: Vec::new(),
            regions: BTreeMap::new(),
        }
    }

    /// Rebuilds an arena from raw bytes read back from a program file.
    ///
    /// The region map is not stored in the file; callers restore it from the
    /// records with [`OperandArena::restore_region`].
    pub fn from_raw(mem_width_bytes: usize, bytes: Vec<u8>) -> Self {
        Self {
            mem_width_bytes,
            bytes,
            regions: BTreeMap::new(),
        }
    }

    /// Copies `data` into a fresh region.
    ///
    /// # Returns
    ///
    /// The region's handle, or `BlasError::Alloc` when the arena would grow
    /// past the 32-bit handle space.
    pub fn push(&mut self, data: &[DataType]) -> Result<u32> {
        let offset = self.bytes.len();
        let region = (data.len() * ELEM_BYTES)
            .max(1)
            .div_ceil(self.mem_width_bytes)
            * self.mem_width_bytes;
        let end = offset + region;
        if end >= NULL_HANDLE as usize {
            return Err(BlasError::Alloc {
                requested: region,
                available: (NULL_HANDLE as usize).saturating_sub(offset),
            });
        }

        self.bytes.resize(end, 0);
        LittleEndian::write_f32_into(data, &mut self.bytes[offset..offset + data.len() * ELEM_BYTES]);

        let handle = offset as u32;
        self.regions.insert(handle, data.len());
        Ok(handle)
    }

    /// Element count a handle was registered with, if it was registered by
    /// this arena.
    pub fn region_len(&self, handle: u32) -> Option<usize> {
        self.regions.get(&handle).copied()
    }

    /// Registers `handle` as holding `n` elements, as seen in a record read
    /// back from a file.
    ///
    /// Handles that do not resolve are left unregistered so that decoding
    /// reports them.
    ///
    /// # Returns
    ///
    /// `Ok(())`, or `BlasError::Format` when records disagree on the length
    /// of the same operand.
    pub fn restore_region(&mut self, handle: u32, n: usize) -> Result<()> {
        if self.span(handle, n).is_err() {
            return Ok(());
        }
        match self.regions.insert(handle, n) {
            Some(prev) if prev != n => Err(BlasError::Format(format!(
                "operand {handle:#x} is used with {prev} and {n} elements"
            ))),
            _ => Ok(()),
        }
    }

    /// Drops every region at or past byte `len`.
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
        self.regions.retain(|&h, _| (h as usize) < len);
    }

    fn span(&self, handle: u32, n: usize) -> Result<(usize, usize)> {
        let start = handle as usize;
        if start % self.mem_width_bytes != 0 {
            return Err(BlasError::Handle {
                handle,
                reason: "not aligned to a memory word",
            });
        }
        if start >= self.bytes.len() {
            return Err(BlasError::Handle {
                handle,
                reason: "outside the operand arena",
            });
        }
        let end = n
            .checked_mul(ELEM_BYTES)
            .and_then(|len| len.checked_add(start))
            .filter(|&end| end <= self.bytes.len())
            .ok_or(BlasError::Handle {
                handle,
                reason: "operand runs past the end of the arena",
            })?;
        Ok((start, end))
    }

    /// Copies `n` elements starting at `handle` out of the arena.
    ///
    /// # Returns
    ///
    /// A fresh vector, or `BlasError::Handle` when the handle is misaligned,
    /// outside the arena, or its `n` elements run past the end.
    pub fn read(&self, handle: u32, n: usize) -> Result<Vec<DataType>> {
        let (start, end) = self.span(handle, n)?;
        let mut out = vec![0.0; n];
        LittleEndian::read_f32_into(&self.bytes[start..end], &mut out);
        Ok(out)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_word_padded_and_copied() {
        let mut arena = OperandArena::new(64);
        let a = arena.push(&[1.0, 2.0, 3.0]).unwrap();
        let empty = arena.push(&[]).unwrap();
        let b = arena.push(&[0.5; 17]).unwrap();
        assert_eq!((a, empty, b), (0, 64, 128));
        assert_eq!(arena.len_bytes(), 128 + 128);
        assert_eq!(arena.region_len(b), Some(17));
        assert_eq!(arena.read(a, 3).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(arena.read(empty, 0).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn bad_handles_are_reported() {
        let mut arena = OperandArena::new(64);
        arena.push(&[1.0; 4]).unwrap();
        assert!(matches!(arena.read(4, 1), Err(BlasError::Handle { .. })));
        assert!(matches!(arena.read(64, 1), Err(BlasError::Handle { .. })));
        assert!(matches!(arena.read(0, 17), Err(BlasError::Handle { .. })));
        assert!(arena.read(0, 16).is_ok());
    }

    #[test]
    fn regions_are_restored_and_truncated() {
        let mut arena = OperandArena::new(64);
        arena.push(&[1.0; 4]).unwrap();
        arena.push(&[2.0; 20]).unwrap();
        let mut back = OperandArena::from_raw(64, arena.as_bytes().to_vec());
        assert_eq!(back.region_len(0), None);
        back.restore_region(0, 4).unwrap();
        back.restore_region(0, 4).unwrap();
        back.restore_region(4096, 1).unwrap();
        assert_eq!(back.region_len(0), Some(4));
        assert_eq!(back.region_len(4096), None);
        assert!(matches!(back.restore_region(0, 5), Err(BlasError::Format(_))));

        arena.truncate(64);
        assert_eq!(arena.len_bytes(), 64);
        assert_eq!(arena.region_len(64), None);
        assert_eq!(arena.push(&[3.0]).unwrap(), 64);
    }
}
