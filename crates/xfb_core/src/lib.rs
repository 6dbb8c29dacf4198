//! Core BLAS instruction encoding, reference arithmetic and configuration
//! encoders.
//!
//! This crate provides the instruction record codec and the binary program
//! model consumed by the accelerator, the `GenBin` encoder that builds such
//! programs, a naive reference model used to produce golden results, the
//! device memory allocator and software compute unit used by the host
//! runtime, and the GQE query-engine configuration encoder. File I/O lives in
//! `xfb_io`; this crate only transforms bytes and values.

use std::path::PathBuf;

/// Allocator for accelerator device memory.
///
/// Hands out 4096-byte aligned offsets from a fixed-size device region and
/// takes single buffers back, merging free neighbours.
pub mod allocator;

/// Operand storage for encoded programs.
///
/// Owns the operand data referenced by instruction handles. Every region is
/// padded to a whole number of memory words so a handle always points at a
/// word boundary.
pub mod arena;

/// Fixed-width bit-field helpers for 512-bit configuration words.
///
/// Wraps `bitvec` so that every field write is range checked against its
/// declared width before it touches the word.
pub mod bit_utils;

/// Memory-word geometry validation.
pub mod format;

/// The `GenBin` instruction encoder.
///
/// Builds a [`program::Program`] one Level-1 instruction at a time, copying
/// operand data into the owned arena and returning the handles assigned to
/// each slot so callers can chain results into later instructions.
pub mod genbin;

/// GQE query-engine configuration encoder.
///
/// Packs filter conditions, ALU expressions, shuffle tables and join flags
/// into the nine 512-bit words the query engine reads before a run.
pub mod gqe;

/// Instruction record codec.
///
/// Encodes and decodes the fixed-size little-endian records for vector
/// (Level-1) and matrix (Level-2/Level-3) operations.
pub mod instr;

/// Ordered instruction sequence plus its operand arena, and the binary
/// program image built from them.
pub mod program;

/// Naive reference implementations of every supported BLAS operation.
///
/// Used to produce golden results for generated programs and to check the
/// output of the accelerator within tolerance.
pub mod reference;

/// Software compute unit.
///
/// Decodes the exact instruction stream the host runtime produces and runs
/// the matrix operations against a kernel instance's device memory.
pub mod vm;

/// Status codes reported by the `xfblas*` family.
///
/// Every [`BlasError`] maps onto one of these through [`BlasError::status`].
/// The first six values are fixed by the host API; the remaining ones report
/// failures of the encoder and program-file layer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XfblasStatus {
    Success = 0,
    NotInitialized = 1,
    InvalidValue = 2,
    AllocFailed = 3,
    NotSupported = 4,
    NotPadded = 5,
    InvalidOp = 7,
    InvalidFile = 8,
    InvalidProgram = 9,
    ExecFailed = 10,
}

impl XfblasStatus {
    /// Returns true when the status reports success.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Error types returned by the encoder, the runtime and the GQE builder.
///
/// User input always produces one of these; internal invariants of the
/// encoder's own output are asserted instead.
#[derive(Debug, thiserror::Error)]
pub enum BlasError {
    /// Mnemonic or opcode outside the closed instruction set.
    #[error("invalid operation: {0}")]
    InvalidOp(String),

    /// Operand length differs from the instruction's element count.
    #[error("size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Program file or record layout is malformed.
    #[error("format error: {0}")]
    Format(String),

    /// Underlying file-system failure.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Handle is unknown, freed, misaligned or outside its storage.
    #[error("handle {handle:#x}: {reason}")]
    Handle { handle: u32, reason: &'static str },

    /// Runtime used before creation or after destruction.
    #[error("runtime not ready: {0}")]
    NotReady(&'static str),

    /// Engine configuration is missing a key or holds an unparsable value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Accelerator image is missing or not an accelerator image.
    #[error("failed to load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// Device memory exhausted.
    #[error("allocation of {requested} bytes failed, {available} bytes available")]
    Alloc { requested: usize, available: usize },

    /// Host buffer does not satisfy the DMA alignment.
    #[error("host buffer offset {offset:#x} is not aligned to {align} bytes")]
    BadAlignment { offset: usize, align: usize },

    /// Operation dimensions do not fit the registered buffers.
    #[error("dimension mismatch: {0}")]
    DimMismatch(String),

    /// The compute unit rejected or failed an instruction.
    #[error("execution failed: {0}")]
    Exec(String),

    /// Handle released twice.
    #[error("handle {0:#x} was already freed")]
    DoubleFree(u32),

    /// A configuration field holds a value outside its declared range.
    #[error("{field} = {value} is outside {min}..={max}")]
    Range {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Argument outside its permitted domain.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Restricted allocation with dimensions that are not multiples of the
    /// engine's minimum block size.
    #[error("dimension {0} is not padded to a multiple of {1}")]
    NotPadded(usize, usize),

    /// Feature not provided by the engine.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

impl BlasError {
    /// Maps the error onto the host API status code.
    pub fn status(&self) -> XfblasStatus {
        match self {
            Self::NotReady(_) | Self::Config(_) | Self::Load { .. } => XfblasStatus::NotInitialized,
            Self::SizeMismatch { .. }
            | Self::DimMismatch(_)
            | Self::InvalidValue(_)
            | Self::BadAlignment { .. }
            | Self::Range { .. } => XfblasStatus::InvalidValue,
            Self::Handle { .. } | Self::DoubleFree(_) | Self::Alloc { .. } => {
                XfblasStatus::AllocFailed
            }
            Self::NotSupported(_) => XfblasStatus::NotSupported,
            Self::NotPadded(..) => XfblasStatus::NotPadded,
            Self::InvalidOp(_) => XfblasStatus::InvalidOp,
            Self::Format(_) | Self::Io { .. } => XfblasStatus::InvalidFile,
            Self::Exec(_) => XfblasStatus::ExecFailed,
        }
    }

    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the workspace's library crates.
pub type Result<T> = std::result::Result<T, BlasError>;
