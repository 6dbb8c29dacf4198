//! Subscriber setup for the command-line tools.
//!
//! Diagnostics go to stderr so that stdout only carries tool output. The
//! filter comes from `RUST_LOG` and falls back to `info`.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
