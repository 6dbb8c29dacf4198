//! Programs and their binary image.
//!
//! Image layout, all little-endian:
//!
//! ```text
//! word 0        header: magic[8] version:u16 pad:u16 memWidth:u32 instrSize:u32
//!               argInstrWidth:u32 parEntries:u32 numInstrs:u32 arenaBytes:u64
//! words 1..     numInstrs records, argInstrWidth per memory word
//! tail          operand arena, arenaBytes long
//! ```

use crate::arena::OperandArena;
use crate::format::FormatParams;
use crate::instr::Instr;
use crate::{BlasError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use xfb_common::mem::{PROGRAM_MAGIC, PROGRAM_VERSION};

/// Bytes of the header actually used; the rest of the header word is zero.
const HEADER_FIELDS_BYTES: usize = 40;

/// Ordered instruction sequence plus the operands it references.
///
/// Execution order is the vector order; records carry no dependency edges.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub params: FormatParams,
    pub instrs: Vec<Instr>,
    pub arena: OperandArena,
}

/// Encodes `instrs` into whole memory words.
pub fn encode_stream(params: &FormatParams, instrs: &[Instr]) -> Vec<u8> {
    let mut out = vec![0u8; params.stream_bytes(instrs.len())];
    for (slot, instr) in out
        .chunks_exact_mut(params.instr_size_bytes())
        .zip(instrs)
    {
        instr.encode(slot);
    }
    out
}

/// Decodes the first `count` records of an instruction stream.
pub fn decode_stream(params: &FormatParams, bytes: &[u8], count: usize) -> Result<Vec<Instr>> {
    let size = params.instr_size_bytes();
    let needed = count
        .checked_mul(size)
        .filter(|&n| n <= bytes.len())
        .ok_or_else(|| {
            BlasError::Format(format!(
                "stream of {} bytes cannot hold {count} records",
                bytes.len()
            ))
        })?;
    bytes[..needed].chunks_exact(size).map(Instr::decode).collect()
}

impl Program {
    pub fn new(params: FormatParams) -> Self {
        Self {
            params,
            instrs: Vec::new(),
            arena: OperandArena::new(params.mem_width_bytes()),
        }
    }

    /// Serialises the program into its binary image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let p = &self.params;
        let mut header = vec![0u8; p.mem_width_bytes()];
        header[..8].copy_from_slice(&PROGRAM_MAGIC);
        LittleEndian::write_u16(&mut header[8..], PROGRAM_VERSION);
        LittleEndian::write_u32(&mut header[12..], p.mem_width_bytes() as u32);
        LittleEndian::write_u32(&mut header[16..], p.instr_size_bytes() as u32);
        LittleEndian::write_u32(&mut header[20..], p.arg_instr_width() as u32);
        LittleEndian::write_u32(&mut header[24..], p.par_entries() as u32);
        LittleEndian::write_u32(&mut header[28..], self.instrs.len() as u32);
        LittleEndian::write_u64(&mut header[32..], self.arena.len_bytes() as u64);

        let mut out = header;
        out.extend_from_slice(&encode_stream(p, &self.instrs));
        out.extend_from_slice(self.arena.as_bytes());
        out
    }

    /// Parses a binary image written with the geometry in `expected`.
    ///
    /// # Returns
    ///
    /// The program, or `BlasError::Format` for a bad magic or version, a
    /// header geometry that differs from `expected` or breaks the size
    /// invariant, a truncated or oversized body, or an undecodable record.
    pub fn from_bytes(bytes: &[u8], expected: &FormatParams) -> Result<Self> {
        let truncated = |what: &str| BlasError::Format(format!("truncated program: {what}"));
        if bytes.len() < HEADER_FIELDS_BYTES {
            return Err(truncated("header"));
        }
        if bytes[..8] != PROGRAM_MAGIC {
            return Err(BlasError::Format("bad program magic".into()));
        }

        let mut cursor = Cursor::new(&bytes[8..HEADER_FIELDS_BYTES]);
        let version = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| truncated("header"))?;
        if version != PROGRAM_VERSION {
            return Err(BlasError::Format(format!(
                "unsupported program version {version}"
            )));
        }
        cursor.set_position(4);
        let mut field = || -> Result<usize> {
            cursor
                .read_u32::<LittleEndian>()
                .map(|v| v as usize)
                .map_err(|_| truncated("header"))
        };
        let mem_width = field()?;
        let instr_size = field()?;
        let arg_width = field()?;
        let par_entries = field()?;
        let num_instrs = field()?;
        let arena_bytes = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated("header"))
            .and_then(|v| {
                usize::try_from(v).map_err(|_| BlasError::Format("arena size overflows".into()))
            })?;

        let params = FormatParams::new(mem_width, instr_size, arg_width)?;
        if params != *expected || par_entries != expected.par_entries() {
            return Err(BlasError::Format(format!(
                "program geometry {mem_width}/{instr_size}/{arg_width}/{par_entries} \
                 differs from reader geometry {}/{}/{}/{}",
                expected.mem_width_bytes(),
                expected.instr_size_bytes(),
                expected.arg_instr_width(),
                expected.par_entries()
            )));
        }

        let stream_start = params.mem_width_bytes();
        let arena_start = stream_start + params.stream_bytes(num_instrs);
        let total = arena_start
            .checked_add(arena_bytes)
            .ok_or_else(|| BlasError::Format("arena size overflows".into()))?;
        if bytes.len() < total {
            return Err(truncated("body"));
        }
        if bytes.len() > total {
            return Err(BlasError::Format(format!(
                "{} trailing bytes after the arena",
                bytes.len() - total
            )));
        }
        if arena_bytes % params.mem_width_bytes() != 0 {
            return Err(BlasError::Format(
                "arena is not a whole number of memory words".into(),
            ));
        }

        let instrs = decode_stream(&params, &bytes[stream_start..arena_start], num_instrs)?;
        let mut arena = OperandArena::from_raw(mem_width, bytes[arena_start..total].to_vec());
        for instr in &instrs {
            if let Instr::B1(i) = instr {
                for handle in [i.x, i.y, i.x_res, i.y_res].into_iter().flatten() {
                    arena.restore_region(handle, i.n as usize)?;
                }
            }
        }
        Ok(Self {
            params,
            instrs,
            arena,
        })
    }
}
