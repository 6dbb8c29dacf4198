mod generator;
mod gqe;
mod logging;
mod stats;
mod throughput;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xfb", about = "BLAS accelerator instruction and host tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode operation tuples into a program file.
    ///
    /// Each tuple is `opName n alpha handleX handleY handleResX handleResY
    /// resScalar`; `null` leaves a slot empty.
    Write {
        path: PathBuf,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        tuples: Vec<String>,
    },
    /// Decode a program file and its operands.
    Read { path: PathBuf },
    /// Dump the records of a program file.
    Print { path: PathBuf },
    /// GEMM throughput benchmark against an accelerator image.
    Gemm {
        #[arg(long)]
        xclbin: PathBuf,
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value_t = 256)]
        m: usize,
        #[arg(long, default_value_t = 256)]
        k: usize,
        #[arg(long, default_value_t = 256)]
        n: usize,
        #[arg(long, default_value_t = 1)]
        kernels: usize,
        #[arg(long, default_value_t = 10)]
        reps: usize,
    },
    /// Build a query-engine configuration block.
    Gqe {
        #[arg(long, value_enum, default_value_t = gqe::Preset::Q6)]
        preset: gqe::Preset,
        /// Write the 576-byte block to this file.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Directory of `.dat` columns to run the query over on the host.
        #[arg(long = "in")]
        input: Option<PathBuf>,
        /// Rows to load; defaults to the length of the first column file.
        #[arg(long, requires = "input")]
        rows: Option<usize>,
    },
}

/// Accepts the legacy single-dash mode flags
/// (`-write`, `-read`, `-print`) as subcommands.
fn normalized_args() -> Vec<OsString> {
    let mut args: Vec<OsString> = env::args_os().collect();
    if let Some(mode) = args.get_mut(1) {
        let renamed = mode
            .to_str()
            .and_then(|s| s.strip_prefix('-'))
            .filter(|s| matches!(*s, "write" | "read" | "print"))
            .map(OsString::from);
        if let Some(renamed) = renamed {
            *mode = renamed;
        }
    }
    args
}

fn main() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse_from(normalized_args());
    match cli.command {
        Commands::Write { path, tuples } => {
            generator::write_program(&path, &tuples)?;
        }
        Commands::Read { path } => {
            generator::read_program(&path)?;
        }
        Commands::Print { path } => {
            generator::print_program(&path)?;
        }
        Commands::Gemm {
            xclbin,
            config,
            m,
            k,
            n,
            kernels,
            reps,
        } => {
            throughput::run_benchmark(&xclbin, &config, (m, k, n), kernels, reps)?;
        }
        Commands::Gqe {
            preset,
            out,
            input,
            rows,
        } => {
            gqe::run(preset, out.as_deref(), input.as_deref(), rows)?;
        }
    }
    Ok(())
}
