//! `gqe` subcommand: configuration blocks for the query engine.

use anyhow::{Context, Result, ensure};
use clap::ValueEnum;
use std::fs;
use std::path::Path;
use tracing::info;
use xfb_core::gqe::{ConfigBlock, Q6_COLUMNS, QueryShape, build_config, pass_through_shape, q6_shape};
use xfb_io::columns::{load_columns, pack_table};

const WORD_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// TPC-H Q6: filtered sum of extended price times discount.
    Q6,
    /// Every row passes, nothing is computed.
    Pass,
}

impl Preset {
    fn shape(self) -> QueryShape {
        match self {
            Self::Q6 => q6_shape(),
            Self::Pass => pass_through_shape(),
        }
    }
}

/// Prints each 512-bit word as sixteen 32-bit lanes, highest lane first.
fn dump(block: &ConfigBlock) {
    let bytes = block.to_bytes();
    for (i, word) in bytes.chunks_exact(WORD_BYTES).enumerate() {
        let lanes: Vec<String> = word
            .chunks_exact(4)
            .rev()
            .map(|b| format!("{:08x}", u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect();
        println!("word {i}: {}", lanes.join(" "));
    }
}

/// Host evaluation of the Q6 shape: rows passing the filter and the
/// aggregated ALU result.
pub fn evaluate_q6(shape: &QueryShape, columns: &[Vec<u32>]) -> Result<(usize, i64)> {
    ensure!(columns.len() == Q6_COLUMNS.len(), "Q6 reads {} columns", Q6_COLUMNS.len());
    let alu = shape.alu[0].context("the shape has no ALU expression")?;
    let rows = columns[0].len();
    let (mut hits, mut revenue) = (0usize, 0i64);
    for r in 0..rows {
        let row = [columns[0][r], columns[1][r], columns[2][r], columns[3][r]];
        if shape.filter_a.evaluate(&row) {
            hits += 1;
            revenue = revenue.wrapping_add(alu.evaluate(row)?);
        }
    }
    Ok((hits, revenue))
}

pub fn run(preset: Preset, out: Option<&Path>, input: Option<&Path>, rows: Option<usize>) -> Result<()> {
    let shape = preset.shape();
    let block = build_config(&shape).context("failed to build the configuration block")?;
    println!("{preset:?} configuration:");
    dump(&block);

    if let Some(out) = out {
        fs::write(out, block.to_bytes()).with_context(|| format!("failed to write {}", out.display()))?;
        info!(path = %out.display(), "wrote configuration block");
    }

    if let Some(dir) = input {
        ensure!(preset == Preset::Q6, "only the Q6 preset can be run over column files");
        let rows = match rows {
            Some(rows) => rows,
            None => {
                let first = dir.join(format!("{}.dat", Q6_COLUMNS[0]));
                let len = fs::metadata(&first)
                    .with_context(|| format!("failed to stat {}", first.display()))?
                    .len();
                usize::try_from(len / 4).context("column too large")?
            }
        };
        let columns = load_columns(dir, &Q6_COLUMNS, rows)?;
        let table = pack_table(&columns)?;
        let (hits, revenue) = evaluate_q6(&shape, &columns)?;
        println!("Table: {rows} rows, {} bytes packed", table.len());
        println!("Matching rows: {hits}");
        println!("Revenue: {revenue}");
    }
    Ok(())
}
