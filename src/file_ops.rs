//! Atomic artifact writes and scoped directory creation.
//!
//! Artifacts are staged in a temporary file beside their destination and
//! renamed into place, so the supervisor never observes a half-written file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

use crate::error::{Result, ServiceError};

/// How a staged write compared with what was already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactChange {
    Created,
    Updated,
    Unchanged,
}

/// Create `dir` and its ancestors; succeeds if it already exists.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| ServiceError::fs(dir, e))
}

/// Create the parent directory of `path`, if it has one.
pub fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

/// Current artifact text, or `None` if no file exists.
pub fn read_existing(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ServiceError::fs(path, e)),
    }
}

/// Write file atomically to prevent corruption
pub fn write_file_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut staged = NamedTempFile::new_in(dir).map_err(|e| ServiceError::fs(dir, e))?;
    staged
        .write_all(content.as_bytes())
        .map_err(|e| ServiceError::fs(staged.path(), e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| ServiceError::fs(staged.path(), e))?;

    // Supervisors read artifacts as the session user; tempfile creates 0600.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))
            .map_err(|e| ServiceError::fs(staged.path(), e))?;
    }

    staged
        .persist(path)
        .map_err(|e| ServiceError::fs(path, e.error))?;
    Ok(())
}

/// Write `content` to `path` unless the file already holds exactly those bytes.
pub fn stage_artifact(path: &Path, content: &str) -> Result<ArtifactChange> {
    let change = match read_existing(path)? {
        Some(existing) if existing == content => return Ok(ArtifactChange::Unchanged),
        Some(_) => ArtifactChange::Updated,
        None => ArtifactChange::Created,
    };
    ensure_parent(path)?;
    write_file_atomic(path, content)?;
    debug!("artifact {} {:?}", path.display(), change);
    Ok(change)
}

/// Delete `path`; returns whether anything was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ServiceError::fs(path, e)),
    }
}
