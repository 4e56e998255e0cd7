//! Backing files for the disk simulators.
//!
//! The read side needs a file much larger than the page cache would keep hot,
//! filled with incompressible data, so provisioning writes random bytes in
//! chunks and syncs periodically instead of extending a sparse file.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::core::config::DiskConfig;
use crate::core::errors::{Result, SlgError};

const FSYNC_EVERY_BYTES: u64 = 64 * 1024 * 1024;

pub const INPUT_FILE_NAME: &str = "slg-disk-input.dat";
pub const OUTPUT_FILE_NAME: &str = "slg-disk-output.dat";

#[must_use]
pub fn input_path(config: &DiskConfig) -> PathBuf {
    config.directory.join(INPUT_FILE_NAME)
}

#[must_use]
pub fn output_path(config: &DiskConfig) -> PathBuf {
    config.directory.join(OUTPUT_FILE_NAME)
}

/// Make sure `path` exists with exactly `size` bytes of random data.
///
/// Returns `true` when the file was (re)written, `false` when an existing file
/// of the right size was kept.
pub fn ensure_backing_file(path: &Path, size: u64, chunk_bytes: u64) -> Result<bool> {
    if let Ok(meta) = fs::metadata(path)
        && meta.is_file()
        && meta.len() == size
    {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| SlgError::io(parent, err))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|err| SlgError::io(path, err))?;
    write_random(&mut file, path, size, chunk_bytes)?;
    file.sync_all().map_err(|err| SlgError::io(path, err))?;
    Ok(true)
}

fn write_random(file: &mut File, path: &Path, size: u64, chunk_bytes: u64) -> Result<()> {
    let chunk_len = usize::try_from(chunk_bytes.clamp(1, size.max(1))).map_err(|err| {
        SlgError::validation("io_chunk_bytes", format!("chunk does not fit in memory: {err}"))
    })?;
    let mut rng = rand::rng();
    let mut chunk = vec![0u8; chunk_len];
    let mut written = 0u64;
    let mut unsynced = 0u64;
    while written < size {
        let len = usize::try_from((size - written).min(chunk_len as u64)).unwrap_or(chunk_len);
        rng.fill_bytes(&mut chunk[..len]);
        file.write_all(&chunk[..len])
            .map_err(|err| SlgError::io(path, err))?;
        written += len as u64;
        unsynced += len as u64;
        if unsynced >= FSYNC_EVERY_BYTES {
            file.sync_data().map_err(|err| SlgError::io(path, err))?;
            unsynced = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("input.dat");
        assert!(ensure_backing_file(&path, 10_000, 4096).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 10_000);
        let first = fs::read(&path).unwrap();
        assert!(!ensure_backing_file(&path, 10_000, 4096).unwrap());
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn wrong_size_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.dat");
        fs::write(&path, b"short").unwrap();
        assert!(ensure_backing_file(&path, 3000, 1024).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 3000);
    }

    #[test]
    fn contents_are_not_all_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.dat");
        ensure_backing_file(&path, 4096, 4096).unwrap();
        assert!(fs::read(&path).unwrap().iter().any(|byte| *byte != 0));
    }

    #[test]
    fn paths_live_in_the_configured_directory() {
        let config = DiskConfig {
            directory: PathBuf::from("/data/slg"),
            ..DiskConfig::default()
        };
        assert_eq!(input_path(&config), Path::new("/data/slg/slg-disk-input.dat"));
        assert_eq!(output_path(&config), Path::new("/data/slg/slg-disk-output.dat"));
    }
}
