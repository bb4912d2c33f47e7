//! Single-writer guard for a distribution tree.
//!
//! The lock file carries an advisory OS lock plus a liveness token naming the
//! holder. The OS releases the advisory lock when a process dies, but the
//! token stays behind; finding a token on a lock nobody holds means the
//! previous operation was aborted, and the token is force-cleared.

use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IoResultExt, PatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessToken {
    pub pid: u32,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LivenessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} ({}) since {}",
            self.pid,
            self.operation,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Held for the duration of one apply or rollback.
#[derive(Debug)]
pub struct TreeLock {
    file: File,
    path: PathBuf,
}

impl TreeLock {
    /// Take the lock or fail fast with [`PatchError::Locked`].
    pub fn acquire(path: &Path, operation: &str) -> Result<Self> {
        let mut file = open_lock_file(path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == ErrorKind::WouldBlock {
                let holder = read_token(&mut file)
                    .ok()
                    .flatten()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "another process".to_string());
                return Err(PatchError::Locked { holder });
            }
            return Err(PatchError::io(path, e));
        }

        if let Ok(Some(stale)) = read_token(&mut file) {
            warn!(holder = %stale, "previous operation did not release the lock; clearing it");
        }

        let token = LivenessToken {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&token).map_err(|e| PatchError::codec("encode lock token", e))?;
        file.set_len(0).at(path)?;
        file.seek(SeekFrom::Start(0)).at(path)?;
        file.write_all(&bytes).at(path)?;
        file.sync_all().at(path)?;
        debug!(operation, "tree lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Clear a token left by a holder that no longer holds the OS lock.
    /// Returns the cleared token, if there was one.
    pub fn clear_stale(path: &Path) -> Result<Option<LivenessToken>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(PatchError::io(path, e)),
        }
        let stale = read_token(&mut file).unwrap_or(None);
        if let Some(token) = &stale {
            warn!(holder = %token, "clearing stale lock left by an aborted operation");
            file.set_len(0).at(path)?;
        }
        let _ = FileExt::unlock(&file);
        Ok(stale)
    }
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %e, "failed to clear lock token");
        }
        let _ = FileExt::unlock(&self.file);
        debug!("tree lock released");
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .at(path)
}

fn read_token(file: &mut File) -> std::io::Result<Option<LivenessToken>> {
    let mut buf = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut buf)?;
    if buf.trim().is_empty() {
        return Ok(None);
    }
    // an unparseable token still proves somebody left the lock dirty
    Ok(Some(serde_json::from_str(&buf).unwrap_or_else(|_| LivenessToken {
        pid: 0,
        operation: "unknown".to_string(),
        acquired_at: DateTime::<Utc>::default(),
    })))
}
