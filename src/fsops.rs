//! Small filesystem primitives shared across the engine: atomic writes and
//! moves that survive crossing filesystem boundaries.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::{AppError, AppResult};

/// Write `bytes` to `path` via a temporary sibling and an atomic rename.
/// A failure never leaves a partially written file under the final name.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let parent = path.parent().ok_or_else(|| {
        AppError::new("IO/INVALID_PATH", "Destination has no parent directory.")
            .with_context("path", path.display().to_string())
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".mediamend-write")
        .tempfile_in(parent)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_atomic_tempfile")
                .with_context("path", path.display().to_string())
        })?;

    tmp.write_all(bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_atomic_write")
            .with_context("path", path.display().to_string())
    })?;
    tmp.as_file().sync_all().map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_atomic_sync")
            .with_context("path", path.display().to_string())
    })?;

    tmp.persist(path).map_err(|err| {
        AppError::from(err.error)
            .with_context("operation", "write_atomic_rename")
            .with_context("path", path.display().to_string())
    })?;
    Ok(())
}

/// Rename `from` to `to`, falling back to copy-and-remove when the rename
/// fails (cross-device moves). Parent directories are created as needed.
pub fn move_file(from: &Path, to: &Path) -> AppResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "move_create_parent")
                .with_context("path", parent.display().to_string())
        })?;
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Cross-device rename: stage a copy next to the target, then
            // swap it in and drop the source.
            fs::copy(from, to).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "move_copy_fallback")
                    .with_context("from", from.display().to_string())
                    .with_context("to", to.display().to_string())
                    .with_cause(AppError::from(rename_err))
            })?;
            fs::remove_file(from).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "move_cleanup_source")
                    .with_context("path", from.display().to_string())
            })?;
            Ok(())
        }
    }
}
