use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::digest::{display_opt, Digest};

pub type Result<T> = std::result::Result<T, PatchError>;

/// Stable classification of [`PatchError`] for callers that branch on the
/// failure rather than print it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IdentityMismatch,
    DriftDetected,
    AlreadyExists,
    UnexpectedPresence,
    NotInstalled,
    Invalidated,
    AlreadyInstalled,
    RollbackBlocked,
    IoFailure,
    IrrecoverableState,
    ContentNotFound,
    CorruptContent,
    InvalidPatch,
    InvalidBundle,
    UnknownLayer,
    Locked,
    Codec,
    NotInitialized,
    AlreadyInitialized,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::IdentityMismatch => "identity-mismatch",
            ErrorKind::DriftDetected => "drift-detected",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::UnexpectedPresence => "unexpected-presence",
            ErrorKind::NotInstalled => "not-installed",
            ErrorKind::Invalidated => "invalidated",
            ErrorKind::AlreadyInstalled => "already-installed",
            ErrorKind::RollbackBlocked => "rollback-blocked",
            ErrorKind::IoFailure => "io-failure",
            ErrorKind::IrrecoverableState => "irrecoverable-state",
            ErrorKind::ContentNotFound => "content-not-found",
            ErrorKind::CorruptContent => "corrupt-content",
            ErrorKind::InvalidPatch => "invalid-patch",
            ErrorKind::InvalidBundle => "invalid-bundle",
            ErrorKind::UnknownLayer => "unknown-layer",
            ErrorKind::Locked => "locked",
            ErrorKind::Codec => "codec",
            ErrorKind::NotInitialized => "not-initialized",
            ErrorKind::AlreadyInitialized => "already-initialized",
        }
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch {patch_id} expects {expected} but layer {layer} is at {actual}")]
    IdentityMismatch {
        patch_id: String,
        layer: String,
        expected: String,
        actual: String,
    },

    #[error(
        "content drift at {}: expected {}, found {}",
        path.display(),
        display_opt(expected.as_ref()),
        display_opt(actual.as_ref())
    )]
    DriftDetected {
        path: PathBuf,
        expected: Option<Digest>,
        actual: Option<Digest>,
    },

    #[error("{} already exists with different content ({})", path.display(), actual)]
    AlreadyExists { path: PathBuf, actual: Digest },

    #[error("{} is occupied by unexpected content ({})", path.display(), actual)]
    UnexpectedPresence { path: PathBuf, actual: Digest },

    #[error("patch {patch_id} is not installed")]
    NotInstalled { patch_id: String },

    #[error("patch {patch_id} was invalidated by cumulative patch {superseded_by}")]
    Invalidated {
        patch_id: String,
        superseded_by: String,
    },

    #[error("patch {patch_id} is already installed")]
    AlreadyInstalled { patch_id: String },

    #[error("cannot roll back {patch_id}: {blocking} must be rolled back first")]
    RollbackBlocked { patch_id: String, blocking: String },

    #[error("I/O failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "tree left inconsistent after {cause}; unresolved paths: {}",
        display_paths(paths)
    )]
    IrrecoverableState {
        cause: Box<PatchError>,
        paths: Vec<PathBuf>,
    },

    #[error("content {digest} not found in store")]
    ContentNotFound { digest: Digest },

    #[error("stored content {expected} is corrupt (hashes to {actual})")]
    CorruptContent { expected: Digest, actual: Digest },

    #[error("invalid patch {patch_id}: {reason}")]
    InvalidPatch { patch_id: String, reason: String },

    #[error("invalid patch bundle {}: {reason}", path.display())]
    InvalidBundle { path: PathBuf, reason: String },

    #[error("layer {layer} is not part of this installation")]
    UnknownLayer { layer: String },

    #[error("installation is locked by {holder}")]
    Locked { holder: String },

    #[error("failed to {context}: {message}")]
    Codec { context: String, message: String },

    #[error("no installation metadata found at {}", path.display())]
    NotInitialized { path: PathBuf },

    #[error("an installation is already recorded at {}", path.display())]
    AlreadyInitialized { path: PathBuf },
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            PatchError::DriftDetected { .. } => ErrorKind::DriftDetected,
            PatchError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            PatchError::UnexpectedPresence { .. } => ErrorKind::UnexpectedPresence,
            PatchError::NotInstalled { .. } => ErrorKind::NotInstalled,
            PatchError::Invalidated { .. } => ErrorKind::Invalidated,
            PatchError::AlreadyInstalled { .. } => ErrorKind::AlreadyInstalled,
            PatchError::RollbackBlocked { .. } => ErrorKind::RollbackBlocked,
            PatchError::Io { .. } => ErrorKind::IoFailure,
            PatchError::IrrecoverableState { .. } => ErrorKind::IrrecoverableState,
            PatchError::ContentNotFound { .. } => ErrorKind::ContentNotFound,
            PatchError::CorruptContent { .. } => ErrorKind::CorruptContent,
            PatchError::InvalidPatch { .. } => ErrorKind::InvalidPatch,
            PatchError::InvalidBundle { .. } => ErrorKind::InvalidBundle,
            PatchError::UnknownLayer { .. } => ErrorKind::UnknownLayer,
            PatchError::Locked { .. } => ErrorKind::Locked,
            PatchError::Codec { .. } => ErrorKind::Codec,
            PatchError::NotInitialized { .. } => ErrorKind::NotInitialized,
            PatchError::AlreadyInitialized { .. } => ErrorKind::AlreadyInitialized,
        }
    }

    /// Whether the whole apply/rollback call may simply be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::IoFailure | ErrorKind::Locked)
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PatchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn codec(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PatchError::Codec {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn invalid_patch(patch_id: &str, reason: impl Into<String>) -> Self {
        PatchError::InvalidPatch {
            patch_id: patch_id.to_string(),
            reason: reason.into(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Attach the offending path to a raw I/O result.
pub trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| PatchError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_message_names_path_and_digests() {
        let expected = Digest::of(b"old");
        let err = PatchError::DriftDetected {
            path: PathBuf::from("bin/standalone.conf"),
            expected: Some(expected),
            actual: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("bin/standalone.conf"));
        assert!(msg.contains(&expected.to_hex()));
        assert!(msg.contains("absent"));
        assert_eq!(err.kind(), ErrorKind::DriftDetected);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_is_retryable() {
        let err = PatchError::io("x", io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(err.is_retryable());
        assert_eq!(err.kind().code(), "io-failure");
    }

    #[test]
    fn test_irrecoverable_lists_paths() {
        let err = PatchError::IrrecoverableState {
            cause: Box::new(PatchError::NotInstalled {
                patch_id: "p1".into(),
            }),
            paths: vec![PathBuf::from("a"), PathBuf::from("b/c")],
        };
        let msg = err.to_string();
        assert!(msg.contains("a, b/c"));
        assert!(msg.contains("p1"));
    }
}
