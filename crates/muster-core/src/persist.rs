//! Atomic file persistence for the keystore and its sidecars.
//!
//! The writer stage must never leave a partially-written key file behind: a
//! crash mid-flush has to leave either the old complete file or the new
//! complete file. [`atomic_write`] implements the temp-file + fsync + rename
//! protocol:
//!
//! 1. A temp file is created in the same directory as the target (same
//!    filesystem, so the rename is atomic).
//! 2. The data is written, flushed, and fsynced.
//! 3. The temp file is renamed over the target.
//! 4. The parent directory is fsynced so the rename itself is durable.
//!
//! Temp files are created with mode 0600; a created parent directory gets
//! 0700. Agent keys pass through here, so group/world readability is never
//! acceptable.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use thiserror::Error;

/// Errors from atomic persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The target path has no parent directory to anchor the temp file.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically.
///
/// # Errors
///
/// Returns [`PersistError`] if any filesystem step fails; on failure the
/// previous contents of `path` are untouched.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| PersistError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    ensure_parent_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| PersistError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| PersistError::io("write to temp file", e))?;
    tmp.flush()
        .map_err(|e| PersistError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| PersistError::io("fsync temp file", e))?;

    tmp.persist(path)
        .map_err(|e| PersistError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent)
}

fn ensure_parent_dir(parent: &Path) -> Result<(), PersistError> {
    if parent.exists() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|e| PersistError::io("create parent directory with mode 0700", e))?;
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(parent)
            .map_err(|e| PersistError::io("create parent directory", e))?;
    }

    Ok(())
}

/// Calls `fsync` on a directory to commit rename operations.
fn fsync_directory(dir: &Path) -> Result<(), PersistError> {
    let dir_file =
        File::open(dir).map_err(|e| PersistError::io("open directory for fsync", e))?;
    dir_file
        .sync_all()
        .map_err(|e| PersistError::io("fsync directory", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.keys");

        atomic_write(&path, b"001 web01 any aa\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "001 web01 any aa\n");

        atomic_write(&path, b"001 web01 any bb\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "001 web01 any bb\n");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("agent.keys");

        atomic_write(&path, b"x").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x");
    }

    #[test]
    #[cfg(unix)]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.keys");
        atomic_write(&path, b"secret").unwrap();

        let mode = fs::metadata(&path).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600, "key file should have mode 0600, got {mode:o}");
    }

    #[test]
    fn bare_filename_is_rejected() {
        assert!(matches!(
            atomic_write(Path::new("no-parent"), b"x"),
            Err(PersistError::NoParentDirectory { .. })
        ));
    }
}
