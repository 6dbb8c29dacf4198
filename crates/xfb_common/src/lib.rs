//! Common definitions shared by the BLAS instruction encoder, the host runtime
//! and the command-line tools.
//!
//! This crate provides the memory-word geometry of the accelerator's
//! instruction stream, the instruction set (operation classes and opcodes),
//! and the fixed byte offsets of every field inside an instruction record.
//! Everything here is plain data so it can be shared by host tools and by the
//! software compute unit without pulling in an allocator.

#![no_std]

// Memory-word geometry of the accelerator's instruction and operand streams.
//
// The accelerator fetches instructions and operands in whole memory words.
// An instruction record must tile the word exactly, which is checked at
// compile time below and again whenever a program file is read back.
pub mod mem {
    /// Width of one accelerator memory word in bytes (a 512-bit bus).
    pub const MEM_WIDTH_BYTES: usize = 64;

    /// Size of one encoded instruction record in bytes.
    ///
    /// Every record, whatever its operation class, occupies exactly this many
    /// bytes. Unused trailing bytes are written as zero.
    pub const INSTR_SIZE_BYTES: usize = 64;

    /// Number of instruction records packed into one memory word.
    pub const ARG_INSTR_WIDTH: usize = 1;

    /// Number of data elements delivered per memory word.
    ///
    /// Operand vectors are padded to a whole number of memory words, so this
    /// is also the granularity of every operand region in the arena.
    pub const PAR_ENTRIES: usize = MEM_WIDTH_BYTES / core::mem::size_of::<f32>();

    /// Smallest record size able to hold the largest record layout (GEMM).
    pub const MIN_RECORD_BYTES: usize = 48;

    /// Required alignment of host memory bound with a restricted allocation.
    ///
    /// Matches the page size the DMA engine expects for pinned buffers.
    pub const HOST_ALIGNMENT: usize = 4096;

    /// Sentinel stored in a handle slot when the operand is absent.
    pub const NULL_HANDLE: u32 = u32::MAX;

    /// Magic bytes at the start of a binary program file.
    pub const PROGRAM_MAGIC: [u8; 8] = *b"XFBLASB\0";

    /// Version of the binary program layout written by this crate.
    pub const PROGRAM_VERSION: u16 = 1;

    /// Magic bytes at the start of an accelerator image.
    pub const XCLBIN_MAGIC: [u8; 8] = *b"xclbin2\0";

    const _: () = assert!(INSTR_SIZE_BYTES * ARG_INSTR_WIDTH == MEM_WIDTH_BYTES);
    const _: () = assert!(INSTR_SIZE_BYTES >= MIN_RECORD_BYTES);
}

/// Instruction set definitions for the BLAS engines.
///
/// Defines the operation classes, the opcodes inside each class and the byte
/// layout of the two record shapes (vector records for Level-1 operations and
/// matrix records for Level-2/Level-3 operations).
pub mod isa {
    /// Family an instruction record belongs to.
    ///
    /// The class is the first byte of every record and selects which of the
    /// two record layouts the remaining bytes follow.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum OpClass {
        /// Level-1 vector operations (`amin`, `axpy`, `dot`, ...).
        B1 = 0x01,
        /// Level-2 matrix-vector operations (`gemv`).
        B2 = 0x02,
        /// Level-3 matrix-matrix operations (`gemm`).
        B3 = 0x03,
    }

    impl OpClass {
        /// Decodes a class byte, returning `None` for unknown values.
        pub fn from_u8(value: u8) -> Option<Self> {
            match value {
                0x01 => Some(Self::B1),
                0x02 => Some(Self::B2),
                0x03 => Some(Self::B3),
                _ => None,
            }
        }
    }

    /// Operation code identifying a single BLAS routine.
    ///
    /// Level-1 codes sit below `0x20`; the numeric values are part of the
    /// wire format and must not be renumbered.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Opcode {
        /// Index of the element with the smallest magnitude.
        Amin = 0x01,
        /// Index of the element with the largest magnitude.
        Amax = 0x02,
        /// Sum of magnitudes.
        Asum = 0x03,
        /// `y := alpha * x + y`.
        Axpy = 0x04,
        /// `y := x`.
        Copy = 0x05,
        /// Inner product of `x` and `y`.
        Dot = 0x06,
        /// Euclidean norm of `x`.
        Nrm2 = 0x07,
        /// `x := alpha * x`.
        Scal = 0x08,
        /// Exchange `x` and `y`.
        Swap = 0x09,
        /// `y := alpha * A * x + beta * y`.
        Gemv = 0x20,
        /// `C := alpha * A * B + beta * C`.
        Gemm = 0x30,
    }

    /// Every opcode paired with its mnemonic, in opcode order.
    pub const MNEMONICS: [(Opcode, &str); 11] = [
        (Opcode::Amin, "amin"),
        (Opcode::Amax, "amax"),
        (Opcode::Asum, "asum"),
        (Opcode::Axpy, "axpy"),
        (Opcode::Copy, "copy"),
        (Opcode::Dot, "dot"),
        (Opcode::Nrm2, "nrm2"),
        (Opcode::Scal, "scal"),
        (Opcode::Swap, "swap"),
        (Opcode::Gemv, "gemv"),
        (Opcode::Gemm, "gemm"),
    ];

    impl Opcode {
        /// Decodes an opcode byte, returning `None` for unknown values.
        pub fn from_u8(value: u8) -> Option<Self> {
            MNEMONICS
                .iter()
                .map(|&(op, _)| op)
                .find(|&op| op as u8 == value)
        }

        /// Looks up an opcode by mnemonic, ignoring ASCII case.
        pub fn from_mnemonic(name: &str) -> Option<Self> {
            MNEMONICS
                .iter()
                .find(|(_, m)| m.eq_ignore_ascii_case(name))
                .map(|&(op, _)| op)
        }

        /// Lower-case mnemonic used by the instruction-generator tool.
        pub fn mnemonic(self) -> &'static str {
            MNEMONICS
                .iter()
                .find(|&&(op, _)| op == self)
                .map(|&(_, m)| m)
                .unwrap_or("?")
        }

        /// Operation class this opcode is issued under.
        pub fn class(self) -> OpClass {
            match self {
                Self::Gemv => OpClass::B2,
                Self::Gemm => OpClass::B3,
                _ => OpClass::B1,
            }
        }
    }

    /// Engine an accelerator image is built for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Engine {
        /// Matrix-matrix engine, accepts B3 records.
        Gemm,
        /// Matrix-vector engine, accepts B2 records.
        Gemv,
    }

    impl Engine {
        /// Configuration key that must be `1` for this engine to be usable.
        pub fn run_key(self) -> &'static str {
            match self {
                Self::Gemm => "GEMX_runGemm",
                Self::Gemv => "GEMX_runGemv",
            }
        }

        /// Opcode the engine executes.
        pub fn opcode(self) -> Opcode {
            match self {
                Self::Gemm => Opcode::Gemm,
                Self::Gemv => Opcode::Gemv,
            }
        }
    }

    /// Byte offsets of the vector (B1) record fields.
    pub mod b1 {
        pub const CLASS: usize = 0;
        pub const OPCODE: usize = 1;
        pub const N: usize = 4;
        pub const ALPHA: usize = 8;
        pub const RES_SCALAR: usize = 12;
        pub const X: usize = 16;
        pub const Y: usize = 20;
        pub const X_RES: usize = 24;
        pub const Y_RES: usize = 28;
    }

    /// Byte offsets of the matrix (B2/B3) record fields.
    pub mod mat {
        pub const CLASS: usize = 0;
        pub const OPCODE: usize = 1;
        /// Bit 0: A transposed, bit 1: B transposed.
        pub const FLAGS: usize = 2;
        pub const M: usize = 4;
        pub const K: usize = 8;
        pub const N: usize = 12;
        pub const ALPHA: usize = 16;
        pub const BETA: usize = 20;
        pub const A: usize = 24;
        pub const B: usize = 28;
        pub const C: usize = 32;
        pub const LDA: usize = 36;
        pub const LDB: usize = 40;
        pub const LDC: usize = 44;
    }
}
