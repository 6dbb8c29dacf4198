//! Host runtime for the BLAS accelerator.
//!
//! A [`RuntimeContext`] owns one or more kernel instances. Each instance has
//! its own device memory, buffer handle table and pending instruction
//! buffer. Data is moved between host and device with the `set_*` and
//! `get_*` families; `gemm` and `gemv` queue encoded records that run when
//! results are next read back or the instance is synchronized.
//!
//! Every operation returns `Result<T, BlasError>`. The status code of an
//! error is available through [`xfb_core::BlasError::status`].

/// Page-aligned host memory used for restricted and managed buffers.
///
/// A [`host::HostBuffer`] is backed by whole 4096-byte pages so it always
/// satisfies the alignment the DMA engine requires, unless it is built with
/// an explicit offset into its first page.
pub mod host;

/// Per-instance state: device memory, handle table and pending records.
mod instance;

/// The `xfblas` API surface.
///
/// Creation from an accelerator image and `config_info.dat`, buffer
/// registration, data movement, GEMM/GEMV dispatch, release and teardown.
pub mod context;

pub use context::{DestroyReport, LeakedBuffer, ManagedBuffer, RuntimeContext};
pub use host::{HostBuffer, SharedHostBuffer};

/// Buffer handle, unique within one kernel instance.
pub type Handle = u32;

/// Operand transform selector of `gemm` and `gemv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transpose {
    /// Use the operand as stored.
    #[default]
    N,
    /// Transposed operand.
    T,
    /// Conjugate-transposed operand.
    C,
}
