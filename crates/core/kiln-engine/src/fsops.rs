//! Filesystem helpers used by rule actions.
//!
//! All functions take absolute (root-joined) paths; resolving target
//! strings against the project root is the caller's job.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// Ensure `dir` exists, creating missing ancestors.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| BuildError::io("create directory", dir, e))
}

/// Copy a file, or a directory tree, to `dst`.
///
/// Missing parents of `dst` are created. Fails with
/// [`BuildError::SourceMissing`] if `src` does not exist.
pub fn copy(src: &Path, dst: &Path) -> Result<()> {
    let meta = match fs::metadata(src) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BuildError::SourceMissing { path: src.into() });
        }
        Err(e) => return Err(BuildError::io("copy", src, e)),
    };

    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(src, dst).map_err(|e| BuildError::io("copy", src, e))?;
        return Ok(());
    }

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            BuildError::io("copy", path, e.into())
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let to = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&to)?;
        } else {
            fs::copy(entry.path(), &to).map_err(|e| BuildError::io("copy", entry.path(), e))?;
        }
    }
    Ok(())
}

/// Remove a file or directory tree. A path that does not exist is not an error.
pub fn remove(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BuildError::io("remove", path, e)),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(BuildError::io("remove", path, e)),
        _ => Ok(()),
    }
}

/// Write `contents` to `path`, creating missing parents.
pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents).map_err(|e| BuildError::io("write", path, e))
}
