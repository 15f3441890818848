//! Atomic file write utility.
//!
//! Single implementation of the write-to-temp-then-rename pattern used for
//! every persistent record (session JSON, chunk spool files).
//!
//! Invariants:
//! - Write goes to a sibling `.tmp` file first, then an atomic rename
//!   replaces the target.
//! - On rename failure, the temp file is cleaned up to avoid stale
//!   artifacts.
//! - Parent directories are created if absent.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::error;

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
/// Returns an error if the temp file cannot be written or the rename fails.
/// On rename failure, attempts to clean up the temp file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let tmp_path = temp_sibling(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "store_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "store_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn no_temp_file_remains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.bin");

        atomic_write(&path, b"data").unwrap();
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/record.json");

        atomic_write(&path, b"nested").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nested");
    }

    #[test]
    fn temp_name_preserves_extension_for_siblings() {
        // Two files that differ only in extension must not share a temp path.
        let a = temp_sibling(Path::new("/x/chunk.0"));
        let b = temp_sibling(Path::new("/x/chunk.1"));
        assert_ne!(a, b);
    }
}
