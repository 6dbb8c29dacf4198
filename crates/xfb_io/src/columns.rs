//! Column data files for the query engine.
//!
//! Each column lives in `<dir>/<name>.dat` as a flat array of little-endian
//! 32-bit values. A table handed to the engine is one header word followed by
//! each column in turn, every column occupying `depth` 512-bit words.

use anyhow::{Context, Result, ensure};
use byteorder::{ByteOrder, LittleEndian};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use xfb_common::mem::MEM_WIDTH_BYTES;

const VALUE_BYTES: usize = 4;

/// Values of one column that fit a memory word.
pub const VALUES_PER_WORD: usize = MEM_WIDTH_BYTES / VALUE_BYTES;

/// Loads the first `rows` values of one column file.
///
/// # Arguments
///
/// * `dir` - Directory holding the `.dat` files
/// * `name` - Column name, the file is `<dir>/<name>.dat`
/// * `rows` - Number of values required
///
/// # Returns
///
/// The values, or an error if the file cannot be read or holds fewer than
/// `rows` values.
pub fn load_dat_column<P: AsRef<Path>>(dir: P, name: &str, rows: usize) -> Result<Vec<u32>> {
    let path = dir.as_ref().join(format!("{name}.dat"));
    let bytes = fs::read(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let available = bytes.len() / VALUE_BYTES;
    ensure!(
        available >= rows,
        "{} entries read from {}, {} entries required",
        available,
        path.display(),
        rows
    );

    let mut values = vec![0u32; rows];
    LittleEndian::read_u32_into(&bytes[..rows * VALUE_BYTES], &mut values);
    debug!(path = %path.display(), rows, "loaded column");
    Ok(values)
}

/// Loads several columns of the same table in parallel.
///
/// All loads complete before this returns; if any column fails the whole
/// load fails and no partial table is returned.
pub fn load_columns<P: AsRef<Path> + Sync>(dir: P, names: &[&str], rows: usize) -> Result<Vec<Vec<u32>>> {
    let dir = dir.as_ref();
    let columns = names
        .par_iter()
        .map(|name| load_dat_column(dir, name, rows))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Failed to load table from {}", dir.display()))?;
    info!(dir = %dir.display(), columns = names.len(), rows, "loaded table");
    Ok(columns)
}

/// Writes one column file.
pub fn write_dat_column<P: AsRef<Path>>(dir: P, name: &str, values: &[u32]) -> Result<()> {
    let path = dir.as_ref().join(format!("{name}.dat"));
    let mut bytes = vec![0u8; values.len() * VALUE_BYTES];
    LittleEndian::write_u32_into(values, &mut bytes);
    fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Memory words one column of `rows` values occupies.
pub fn column_depth(rows: usize) -> usize {
    rows.div_ceil(VALUES_PER_WORD).max(1)
}

/// Table header word: row count in bits 0..32, column depth in bits 32..64.
pub fn table_header(nrow: u32, n512b: u32) -> [u8; MEM_WIDTH_BYTES] {
    let mut word = [0u8; MEM_WIDTH_BYTES];
    LittleEndian::write_u32(&mut word[0..4], nrow);
    LittleEndian::write_u32(&mut word[4..8], n512b);
    word
}

/// Packs equally long columns into the engine's table layout.
///
/// Column `c` starts at memory word `1 + depth * c`.
pub fn pack_table(columns: &[Vec<u32>]) -> Result<Vec<u8>> {
    let rows = columns.first().map_or(0, Vec::len);
    ensure!(
        columns.iter().all(|c| c.len() == rows),
        "columns of a table must have the same length"
    );
    let nrow = u32::try_from(rows).context("row count does not fit the table header")?;
    let depth = column_depth(rows);
    let n512b = u32::try_from(depth).context("column depth does not fit the table header")?;

    let mut out = vec![0u8; (1 + depth * columns.len()) * MEM_WIDTH_BYTES];
    out[..MEM_WIDTH_BYTES].copy_from_slice(&table_header(nrow, n512b));
    for (c, column) in columns.iter().enumerate() {
        let start = (1 + depth * c) * MEM_WIDTH_BYTES;
        LittleEndian::write_u32_into(column, &mut out[start..start + rows * VALUE_BYTES]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_columns_in_parallel_and_packs_them() {
        let dir = tempfile::tempdir().unwrap();
        let price: Vec<u32> = (0..40).map(|i| 1000 + i).collect();
        let disc: Vec<u32> = (0..40).map(|i| i % 10).collect();
        write_dat_column(dir.path(), "l_extendedprice", &price).unwrap();
        write_dat_column(dir.path(), "l_discount", &disc).unwrap();

        let cols = load_columns(dir.path(), &["l_extendedprice", "l_discount"], 33).unwrap();
        assert_eq!(cols[0], price[..33]);
        assert_eq!(cols[1], disc[..33]);

        let table = pack_table(&cols).unwrap();
        let depth = column_depth(33);
        assert_eq!(depth, 3);
        assert_eq!(table.len(), (1 + 2 * depth) * 64);
        assert_eq!(LittleEndian::read_u32(&table[0..4]), 33);
        assert_eq!(LittleEndian::read_u32(&table[4..8]), 3);
        let col1 = (1 + depth) * 64;
        assert_eq!(LittleEndian::read_u32(&table[col1 + 4..col1 + 8]), 1);
    }

    #[test]
    fn any_missing_column_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        write_dat_column(dir.path(), "a", &[1, 2, 3]).unwrap();
        assert!(load_columns(dir.path(), &["a", "b"], 3).is_err());
        let err = load_dat_column(dir.path(), "a", 4).unwrap_err();
        assert!(err.to_string().contains("3 entries read"));
        assert!(pack_table(&[vec![1], vec![1, 2]]).is_err());
    }
}
