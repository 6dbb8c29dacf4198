//! Binary program files.

use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use xfb_core::format::FormatParams;
use xfb_core::genbin::GenBin;
use xfb_core::instr::Instr;
use xfb_core::program::Program;
use xfb_core::{BlasError, Result};

/// Writes `program` to `path` atomically.
///
/// The image is written to a temporary file in the same directory and
/// renamed over `path` only once it is complete.
///
/// # Returns
///
/// `Ok(())` on success, or `BlasError::Io` when the directory is not
/// writable or the rename fails. `path` is untouched on failure.
pub fn write_bin_file<P: AsRef<Path>>(path: P, program: &Program) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let bytes = program.to_bytes();

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| BlasError::io(dir, e))?;
    tmp.write_all(&bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| BlasError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| BlasError::io(path, e.error))?;

    info!(
        path = %path.display(),
        instrs = program.instrs.len(),
        bytes = bytes.len(),
        "wrote program"
    );
    Ok(())
}

/// Reads a program written with the geometry in `params`.
///
/// # Returns
///
/// An encoder holding the program, `BlasError::Io` when the file cannot be
/// read, or `BlasError::Format` when its contents are not a valid image for
/// `params`.
pub fn read_from_bin_file<P: AsRef<Path>>(path: P, params: &FormatParams) -> Result<GenBin> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| BlasError::io(path, e))?;
    let program = Program::from_bytes(&bytes, params)?;
    debug!(path = %path.display(), instrs = program.instrs.len(), "read program");
    Ok(GenBin::from_program(program))
}

/// Reads only the instruction records of a program file.
pub fn read_instrs<P: AsRef<Path>>(path: P, params: &FormatParams) -> Result<Vec<Instr>> {
    read_from_bin_file(path, params).map(|g| g.into_program().instrs)
}
