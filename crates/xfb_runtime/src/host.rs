use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::sync::Arc;
use xfb_common::mem::HOST_ALIGNMENT;
use xfb_core::{BlasError, Result};

/// One page of host memory at DMA alignment.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct Page([u8; HOST_ALIGNMENT]);

// SAFETY: a plain byte array with no padding; its size equals its alignment.
unsafe impl Zeroable for Page {}
// SAFETY: as above, every bit pattern is a valid `Page`.
unsafe impl Pod for Page {}

/// Zero-initialized host memory that starts `offset` bytes into a run of
/// page-aligned storage.
#[derive(Clone)]
pub struct HostBuffer {
    pages: Vec<Page>,
    offset: usize,
    len: usize,
}

/// Host buffer shared between the caller and the runtime.
///
/// Restricted and managed allocations keep a clone; the caller fills or
/// reads the buffer between runtime calls.
pub type SharedHostBuffer = Arc<Mutex<HostBuffer>>;

impl HostBuffer {
    /// Allocates `len` zeroed bytes at page alignment.
    pub fn new(len: usize) -> Self {
        Self::with_offset(len, 0)
    }

    /// Allocates `len` zeroed bytes starting `offset` bytes past a page
    /// boundary.
    ///
    /// Only useful to exercise alignment checks; the buffer is misaligned
    /// whenever `offset` is not a multiple of the page size.
    pub fn with_offset(len: usize, offset: usize) -> Self {
        let pages = (offset + len).div_ceil(HOST_ALIGNMENT).max(1);
        Self {
            pages: vec![Page::zeroed(); pages],
            offset,
            len,
        }
    }

    /// Copies a typed slice into a fresh page-aligned buffer.
    pub fn from_slice<T: Pod>(data: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buf = Self::new(bytes.len());
        buf.as_bytes_mut().copy_from_slice(bytes);
        buf
    }

    /// Wraps the buffer for sharing with the runtime.
    pub fn into_shared(self) -> SharedHostBuffer {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the first byte sits on a page boundary.
    pub fn is_aligned(&self) -> bool {
        (self.as_bytes().as_ptr() as usize) % HOST_ALIGNMENT == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Page, u8>(&self.pages)[self.offset..self.offset + self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.offset, self.offset + self.len);
        &mut bytemuck::cast_slice_mut::<Page, u8>(&mut self.pages)[start..end]
    }

    /// Overwrites the start of the buffer with `src`.
    ///
    /// # Returns
    ///
    /// `Ok(())`, or `BlasError::InvalidValue` when `src` does not fit.
    pub fn write<T: Pod>(&mut self, src: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        if bytes.len() > self.len {
            return Err(BlasError::InvalidValue(format!(
                "{} bytes do not fit a host buffer of {} bytes",
                bytes.len(),
                self.len
            )));
        }
        self.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copies the whole buffer out as elements of `T`, ignoring a trailing
    /// partial element.
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        let size = std::mem::size_of::<T>();
        let mut out = vec![T::zeroed(); self.len / size];
        let n = out.len() * size;
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&self.as_bytes()[..n]);
        out
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.len)
            .field("aligned", &self.is_aligned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_start_on_page_boundaries() {
        let buf = HostBuffer::new(10);
        assert!(buf.is_aligned());
        assert_eq!(buf.as_bytes(), &[0u8; 10]);
        assert!(!HostBuffer::with_offset(10, 16).is_aligned());
        assert!(HostBuffer::with_offset(10, HOST_ALIGNMENT).is_aligned());
    }

    #[test]
    fn typed_round_trip() {
        let data = [1.5f32, -2.0, 3.25];
        let buf = HostBuffer::from_slice(&data);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.to_vec::<f32>(), data);

        let mut small = HostBuffer::new(4);
        assert!(matches!(small.write(&data), Err(BlasError::InvalidValue(_))));
        small.write(&[7i16, 8]).unwrap();
        assert_eq!(small.to_vec::<i16>(), [7, 8]);
    }
}
