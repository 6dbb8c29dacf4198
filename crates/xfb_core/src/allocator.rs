//! Allocator for accelerator device memory.
//!
//! Manages the device region of one kernel instance as a set of offsets.
//! Free space is kept as a map of disjoint ranges; a reservation takes the
//! first range large enough for it and a release merges the range back with
//! its free neighbours, so buffers freed while others stay live are reused.

use crate::{BlasError, Result};
use std::collections::BTreeMap;
use xfb_common::mem::HOST_ALIGNMENT;

/// First-fit allocator over a device memory region.
///
/// Offsets are relative to the start of the region and aligned to
/// `HOST_ALIGNMENT` so that every buffer can be the target of a page-aligned
/// DMA transfer. Reservations are rounded up to whole pages.
#[derive(Debug)]
pub struct DeviceAllocator {
    /// Total size of the region in bytes.
    len: usize,

    /// Free ranges, offset to length. Adjacent ranges are always merged.
    free: BTreeMap<usize, usize>,
}

/// Page-rounded size of a reservation; empty buffers still take a page so
/// that every live buffer has a distinct offset.
fn block_size(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(HOST_ALIGNMENT)
}

impl DeviceAllocator {
    /// Creates an allocator managing `len` bytes of device memory.
    pub fn new(len: usize) -> Self {
        let mut alloc = Self {
            len,
            free: BTreeMap::new(),
        };
        alloc.reset();
        alloc
    }

    /// Reserves `size` bytes.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes to reserve
    ///
    /// # Returns
    ///
    /// The aligned offset of the reservation, or `BlasError::Alloc` when no
    /// free range can hold it.
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        let exhausted = |alloc: &Self| BlasError::Alloc {
            requested: size,
            available: alloc.largest_free(),
        };
        let Some(block) = block_size(size) else {
            return Err(exhausted(self));
        };
        let found = self
            .free
            .iter()
            .find(|&(_, &len)| len >= block)
            .map(|(&offset, &len)| (offset, len));
        let Some((offset, len)) = found else {
            return Err(exhausted(self));
        };

        self.free.remove(&offset);
        if len > block {
            self.free.insert(offset + block, len - block);
        }
        Ok(offset)
    }

    /// Returns a reservation made by [`DeviceAllocator::allocate`].
    ///
    /// `offset` and `size` must be exactly those of a live reservation.
    pub fn release(&mut self, offset: usize, size: usize) {
        let Some(mut block) = block_size(size) else {
            return;
        };
        debug_assert!(offset % HOST_ALIGNMENT == 0 && offset + block <= self.len);
        debug_assert!(
            self.free
                .range(..offset + block)
                .next_back()
                .is_none_or(|(&o, &l)| o + l <= offset),
            "releasing a range that is already free"
        );

        let end = offset + block;
        let mut start = offset;
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                block += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            block += next_len;
        }
        self.free.insert(start, block);
    }

    /// Bytes currently reserved, including page rounding.
    pub fn used(&self) -> usize {
        self.len - self.free.values().sum::<usize>()
    }

    /// Size of the largest reservation that would currently succeed.
    pub fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Returns the whole region to the free map.
    ///
    /// The caller guarantees no offset handed out earlier is still in use.
    pub fn reset(&mut self) {
        self.free.clear();
        if self.len > 0 {
            self.free.insert(0, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = HOST_ALIGNMENT;

    #[test]
    fn offsets_are_page_aligned_until_exhausted() {
        let mut alloc = DeviceAllocator::new(3 * PAGE);
        assert_eq!(alloc.allocate(10).unwrap(), 0);
        assert_eq!(alloc.allocate(PAGE).unwrap(), PAGE);
        assert!(matches!(
            alloc.allocate(PAGE + 1),
            Err(BlasError::Alloc { available, .. }) if available == PAGE
        ));
        assert_eq!(alloc.used(), 2 * PAGE);
        alloc.reset();
        assert_eq!(alloc.allocate(3 * PAGE).unwrap(), 0);
    }

    #[test]
    fn released_ranges_are_reused_while_others_stay_live() {
        let mut alloc = DeviceAllocator::new(8 * PAGE);
        let keep = alloc.allocate(16).unwrap();
        for _ in 0..100 {
            let big = alloc.allocate(6 * PAGE).unwrap();
            assert_eq!(big, PAGE);
            alloc.release(big, 6 * PAGE);
        }
        assert_eq!(alloc.used(), PAGE);
        alloc.release(keep, 16);
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.largest_free(), 8 * PAGE);
    }

    #[test]
    fn neighbours_merge_in_any_release_order() {
        let mut alloc = DeviceAllocator::new(4 * PAGE);
        let offs: Vec<usize> = (0..4).map(|_| alloc.allocate(PAGE).unwrap()).collect();
        assert!(alloc.allocate(1).is_err());

        alloc.release(offs[1], PAGE);
        alloc.release(offs[3], PAGE);
        assert_eq!(alloc.largest_free(), PAGE);
        alloc.release(offs[2], PAGE);
        assert_eq!(alloc.largest_free(), 3 * PAGE);
        assert_eq!(alloc.allocate(3 * PAGE).unwrap(), PAGE);
        alloc.release(PAGE, 3 * PAGE);
        alloc.release(offs[0], PAGE);
        assert_eq!(alloc.allocate(4 * PAGE).unwrap(), 0);
    }
}
