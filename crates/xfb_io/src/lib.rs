//! File formats read and written by the host tools.
//!
//! Provides the binary program file used by the instruction generator, the
//! `config_info.dat` engine description read when a runtime is created, and
//! the column `.dat` files consumed by the query engine. Everything that
//! touches the file system lives here so `xfb_core` stays a pure transform.

/// Binary program file read and write.
///
/// Writes go through a temporary file in the destination directory that is
/// renamed into place, so a failed write never leaves a partial program.
pub mod binfile;

/// Column data files.
///
/// Reads one little-endian `u32` file per column, loading all columns of a
/// table in parallel, and packs them into the engine's table layout.
pub mod columns;

/// Parser for the `key=value` engine description written next to every
/// accelerator image.
pub mod config;
