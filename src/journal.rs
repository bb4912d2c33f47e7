//! Write-ahead journal of the apply or rollback in flight.
//!
//! The journal is written before the tree is touched and grows by one
//! [`BackupRecord`] before each modification is performed. Once every
//! modification is done, the history about to be written is recorded as
//! well, and only then are the history files changed. The file is removed
//! when the operation has committed or has been undone, so finding one on
//! an unheld lock means the process died in between:
//!
//! - without a commit section the tree changes are undone;
//! - with one the history writes are completed.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use tracing::trace;

use crate::applier::BackupRecord;
use crate::config::EngineConfig;
use crate::error::{PatchError, Result};
use crate::history::{self, InstalledPatchRecord, LayerHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Apply,
    Rollback,
}

/// History state an operation commits to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalCommit {
    pub layers: Vec<LayerHistory>,
    /// Record saved by an apply. A rollback deletes the record instead.
    pub record: Option<InstalledPatchRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub patch_id: String,
    pub operation: Operation,
    /// Backups of the modifications started so far, in the order they were
    /// started. For a rollback these are the records being inverted.
    pub records: Vec<BackupRecord>,
    pub commit: Option<JournalCommit>,
}

impl Journal {
    /// Start a journal for `operation` on `patch_id` and persist it.
    pub fn begin(config: &EngineConfig, patch_id: &str, operation: Operation) -> Result<Self> {
        let journal = Self {
            patch_id: patch_id.to_string(),
            operation,
            records: Vec::new(),
            commit: None,
        };
        journal.save(config)?;
        Ok(journal)
    }

    pub fn load(config: &EngineConfig) -> Result<Option<Self>> {
        history::read_json(&config.journal_file())
    }

    pub fn save(&self, config: &EngineConfig) -> Result<()> {
        history::write_json(&config.journal_file(), self, config.fsync)
    }

    /// Record `record` before its modification is performed.
    pub fn push(&mut self, config: &EngineConfig, record: BackupRecord) -> Result<()> {
        trace!(item = %record.modification.item, "journaling modification");
        self.records.push(record);
        self.save(config)
    }

    /// Record the history about to be written.
    pub fn commit(&mut self, config: &EngineConfig, commit: JournalCommit) -> Result<()> {
        self.commit = Some(commit);
        self.save(config)
    }

    pub fn clear(config: &EngineConfig) -> Result<()> {
        let path = config.journal_file();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PatchError::io(path, e)),
        }
    }
}
