//! Parser for `config_info.dat`.
//!
//! The file is a list of `key=value` lines. Blank lines are ignored and `#`
//! starts a comment that runs to the end of the line. Keys are identifiers;
//! values are taken verbatim with surrounding whitespace removed.

use nom::IResult;
use nom::bytes::complete::{take_till, take_while1};
use nom::character::complete::{char, space0};
use nom::combinator::{all_consuming, map, opt, rest};
use nom::sequence::{delimited, preceded, separated_pair};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;
use xfb_common::isa::Engine;
use xfb_core::vm::ElemType;
use xfb_core::{BlasError, Result};

const KEY_DATA_TYPE: &str = "GEMX_dataType";
const KEY_DDR_WIDTH: &str = "GEMX_ddrWidth";
const KEY_DDR_SIZE_MB: &str = "GEMX_ddrSizeMB";
const BLOCK_KEYS: [&str; 3] = ["GEMX_gemmMBlocks", "GEMX_gemmKBlocks", "GEMX_gemmNBlocks"];

/// Device memory per kernel instance when the file does not say.
pub const DEFAULT_DEVICE_MB: usize = 64;

/// Largest device region a record's 32-bit offsets can address.
pub const MAX_DEVICE_MB: usize = 4096;

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(char('#'), rest)(input)
}

fn key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn value(input: &str) -> IResult<&str, &str> {
    map(take_till(|c| c == '#'), str::trim)(input)
}

fn line(input: &str) -> IResult<&str, Option<(&str, &str)>> {
    all_consuming(delimited(
        space0,
        opt(separated_pair(key, delimited(space0, char('='), space0), value)),
        opt(comment),
    ))(input)
}

/// Splits a configuration text into its entries.
///
/// # Returns
///
/// The entries in file order, or `BlasError::Config` naming the first line
/// that is neither blank, a comment nor a `key=value` pair.
pub fn parse_entries(text: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (no, raw) in text.lines().enumerate() {
        let raw = raw.trim_end_matches('\r');
        let (_, entry) = line(raw)
            .map_err(|_| BlasError::Config(format!("line {}: cannot parse {raw:?}", no + 1)))?;
        if let Some((k, v)) = entry {
            out.push((k.to_string(), v.to_string()));
        }
    }
    Ok(out)
}

/// Engine description derived from `config_info.dat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub engine: Engine,
    pub elem: ElemType,
    /// Elements per device memory word.
    pub ddr_width: usize,
    /// Granularity every matrix dimension is padded to.
    pub min_size: usize,
    /// Device memory available to each kernel instance.
    pub device_mem_bytes: usize,
    /// Every entry of the file, later keys overriding earlier ones.
    pub entries: BTreeMap<String, String>,
}

fn required<'a>(entries: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    entries
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| BlasError::Config(format!("missing required key {key}")))
}

fn positive(key: &str, raw: &str) -> Result<usize> {
    raw.parse::<usize>()
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| BlasError::Config(format!("{key}={raw} is not a positive integer")))
}

impl EngineConfig {
    /// Parses a configuration text for `engine`.
    pub fn parse(text: &str, engine: Engine) -> Result<Self> {
        Self::from_entries(parse_entries(text)?, engine)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Returns
    ///
    /// The configuration, `BlasError::Io` when the file cannot be read, or
    /// the errors of [`EngineConfig::from_entries`].
    pub fn load<P: AsRef<Path>>(path: P, engine: Engine) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| BlasError::io(path, e))?;
        let config = Self::parse(&text, engine)?;
        debug!(
            path = %path.display(),
            engine = ?config.engine,
            min_size = config.min_size,
            "loaded engine config"
        );
        Ok(config)
    }

    /// Builds the engine description from parsed entries.
    ///
    /// # Returns
    ///
    /// The configuration, `BlasError::Config` when a required key is
    /// missing or a value cannot be parsed, or `BlasError::InvalidValue` when
    /// the engine's run flag is present but not `1`.
    pub fn from_entries<I>(entries: I, engine: Engine) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let entries: BTreeMap<String, String> = entries.into_iter().collect();

        let data_type = required(&entries, KEY_DATA_TYPE)?;
        let elem = ElemType::parse(data_type).ok_or_else(|| {
            BlasError::Config(format!("{KEY_DATA_TYPE}={data_type} is not a supported type"))
        })?;
        let ddr_width = positive(KEY_DDR_WIDTH, required(&entries, KEY_DDR_WIDTH)?)?;

        let run = required(&entries, engine.run_key())?;
        if run != "1" {
            return Err(BlasError::InvalidValue(format!(
                "{}={run}, the engine is not enabled in this image",
                engine.run_key()
            )));
        }

        let min_size = match engine {
            Engine::Gemm => {
                let mut blocks = 1;
                for key in BLOCK_KEYS {
                    if let Some(raw) = entries.get(key) {
                        blocks = blocks.max(positive(key, raw)?);
                    }
                }
                ddr_width * blocks
            }
            Engine::Gemv => ddr_width,
        };

        let device_mb = match entries.get(KEY_DDR_SIZE_MB) {
            Some(raw) => positive(KEY_DDR_SIZE_MB, raw)?,
            None => DEFAULT_DEVICE_MB,
        };
        let device_mem_bytes = device_mb
            .checked_mul(1 << 20)
            .filter(|_| device_mb <= MAX_DEVICE_MB)
            .ok_or_else(|| {
                BlasError::Config(format!(
                    "{KEY_DDR_SIZE_MB}={device_mb} exceeds the {MAX_DEVICE_MB} MB a kernel can address"
                ))
            })?;

        Ok(Self {
            engine,
            elem,
            ddr_width,
            min_size,
            device_mem_bytes,
            entries,
        })
    }

    /// Rounds a dimension up to the engine's block size.
    pub fn padded(&self, dim: usize) -> usize {
        dim.div_ceil(self.min_size) * self.min_size
    }
}
