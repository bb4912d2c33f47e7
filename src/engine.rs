//! Apply and rollback orchestration for one distribution tree.
//!
//! Every operation runs under the tree lock and is all-or-nothing: when a
//! step fails, whatever this call already did to the tree is undone before
//! the error is returned. Only when that undo fails as well does the caller
//! see [`PatchError::IrrecoverableState`]. A process that dies mid-operation
//! leaves a [`Journal`] behind, which the next [`Engine::open`] resolves.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::applier::{Applier, BackupRecord};
use crate::config::EngineConfig;
use crate::content_store::ContentStore;
use crate::error::{IoResultExt, PatchError, Result};
use crate::history::{
    InstallationHistory, InstallationInfo, InstalledPatch, InstalledPatchRecord, LayerInfo,
};
use crate::journal::{Journal, JournalCommit, Operation};
use crate::lock::TreeLock;
use crate::patch_format::{
    self, ApplySummary, ContentItem, ContentModification, ItemType, Patch, PatchBundle,
};
use crate::util;

/// Layer declared when `init` is given no base layer.
pub const DEFAULT_LAYER: &str = "base";

/// Identity of the installation after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledIdentity {
    pub patch_id: String,
    pub product_name: String,
    /// Baseline version of the identity layer.
    pub version: String,
    pub cumulative_patch_id: Option<String>,
    pub one_offs: Vec<String>,
    /// Layers the patch was recorded on.
    pub layers: Vec<String>,
    pub summary: ApplySummary,
}

/// Identity of the installation after a successful rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredIdentity {
    pub patch_id: String,
    pub product_name: String,
    pub version: String,
    pub cumulative_patch_id: Option<String>,
    pub one_offs: Vec<String>,
    /// Every patch this call rolled back, in the order it happened. Only
    /// longer than one when `rollback_to` had to clear patches on top.
    pub rolled_back: Vec<String>,
    /// Modifications inverted for the requested patch itself.
    pub summary: ApplySummary,
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: ContentStore,
    history: InstallationHistory,
    restart_required: bool,
}

impl Engine {
    /// Record a fresh installation of `product_name` at `version`.
    ///
    /// The first non add-on layer carries identity-level patches; when none
    /// is declared a [`DEFAULT_LAYER`] is added in front.
    pub fn init(
        config: EngineConfig,
        product_name: &str,
        version: &str,
        layers: &[LayerInfo],
    ) -> Result<Self> {
        if config.installation_file().exists() {
            return Err(PatchError::AlreadyInitialized {
                path: config.metadata_dir.clone(),
            });
        }
        if product_name.trim().is_empty() || version.trim().is_empty() {
            return Err(PatchError::codec(
                "initialise installation",
                "product name and version must not be empty",
            ));
        }

        let mut declared = layers.to_vec();
        if !declared.iter().any(|l| !l.add_on) {
            declared.insert(
                0,
                LayerInfo {
                    name: DEFAULT_LAYER.to_string(),
                    add_on: false,
                },
            );
        }
        validate_layers(&declared)?;

        fs::create_dir_all(&config.root).at(&config.root)?;
        fs::create_dir_all(&config.metadata_dir).at(&config.metadata_dir)?;
        let store = ContentStore::open(config.content_dir(), config.fsync)?;
        let info = InstallationInfo {
            product_name: product_name.to_string(),
            layers: declared,
        };
        let history = InstallationHistory::create(&config, info, version)?;

        info!(
            product = product_name,
            version,
            layers = history.info().layers.len(),
            root = %config.root.display(),
            "installation initialised"
        );
        Ok(Self {
            config,
            store,
            history,
            restart_required: false,
        })
    }

    /// Load an existing installation.
    ///
    /// A lock abandoned by an aborted operation is force-cleared. When no
    /// other process holds the lock, an interrupted operation's journal is
    /// resolved and staging leftovers are swept before the engine is handed
    /// out.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let history = InstallationHistory::load(&config)?;
        let store = ContentStore::open(config.content_dir(), config.fsync)?;
        let aborted = TreeLock::clear_stale(&config.lock_file())?.is_some();

        let mut engine = Self {
            config,
            store,
            history,
            restart_required: false,
        };
        if aborted || engine.config.journal_file().exists() {
            engine.recover()?;
        }

        debug!(root = %engine.config.root.display(), "installation opened");
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn product_name(&self) -> &str {
        &self.history.info().product_name
    }

    pub fn layers(&self) -> &[LayerInfo] {
        &self.history.info().layers
    }

    /// Name of the layer identity-level patches are recorded on.
    pub fn identity_layer(&self) -> Result<&str> {
        self.history
            .info()
            .identity_layer()
            .map(|l| l.name.as_str())
            .ok_or_else(|| {
                PatchError::codec("resolve identity layer", "installation declares no base layer")
            })
    }

    /// True once any apply or rollback changed the tree through this engine.
    pub fn requires_restart(&self) -> bool {
        self.restart_required
    }

    pub fn current_version(&self, layer: &str) -> Result<String> {
        Ok(self.history.current_baseline(layer)?.to_string())
    }

    pub fn list_installed(&self, layer: &str) -> Result<Vec<InstalledPatch>> {
        self.history.list_installed(layer)
    }

    /// Stored record of an installed (or superseded) patch.
    pub fn patch_info(&self, patch_id: &str) -> Result<InstalledPatchRecord> {
        self.history
            .load_record(patch_id)?
            .ok_or_else(|| PatchError::NotInstalled {
                patch_id: patch_id.to_string(),
            })
    }

    pub fn apply_bundle_file(&mut self, path: &Path) -> Result<InstalledIdentity> {
        let bundle = patch_format::read_bundle(path)?;
        self.apply(&bundle)
    }

    #[instrument(skip(self, bundle), fields(patch_id = %bundle.patch.patch_id))]
    pub fn apply(&mut self, bundle: &PatchBundle) -> Result<InstalledIdentity> {
        let patch = &bundle.patch;
        patch.validate()?;
        let _lock = TreeLock::acquire(
            &self.config.lock_file(),
            &format!("apply {}", patch.patch_id),
        )?;
        // other processes may have committed since this engine was opened
        self.history = InstallationHistory::load(&self.config)?;
        let start = Instant::now();

        let layers = self.check_applicable(patch)?;
        self.import_contents(&bundle.contents)?;
        self.check_content(patch)?;

        info!(
            cumulative = patch.is_cumulative(),
            layers = ?layers,
            "applying patch"
        );
        let summary = self.install(patch, &layers, Utc::now())?;
        self.restart_required = true;

        info!(
            modifications = summary.total(),
            elapsed = ?start.elapsed(),
            "patch applied"
        );
        let (version, cumulative_patch_id, one_offs) = self.identity_state();
        Ok(InstalledIdentity {
            patch_id: patch.patch_id.clone(),
            product_name: self.product_name().to_string(),
            version,
            cumulative_patch_id,
            one_offs,
            layers,
            summary,
        })
    }

    /// Roll back `patch_id`.
    ///
    /// With `rollback_to` set, patches sitting on top of it are rolled back
    /// first (newest first): later one-offs for a one-off target, newer
    /// cumulative patches and their one-offs for a cumulative target.
    /// Otherwise their presence fails the call.
    #[instrument(skip(self))]
    pub fn rollback(&mut self, patch_id: &str, rollback_to: bool) -> Result<RestoredIdentity> {
        let _lock = TreeLock::acquire(&self.config.lock_file(), &format!("rollback {patch_id}"))?;
        self.history = InstallationHistory::load(&self.config)?;
        let start = Instant::now();

        let mut undone = Vec::new();
        let summary = match self.rollback_patch(patch_id, rollback_to, &mut undone) {
            Ok(summary) => summary,
            Err(e) if undone.is_empty() => return Err(e),
            Err(e) => return Err(self.reinstate(&undone, e)),
        };
        self.restart_required = true;

        let rolled_back: Vec<String> = undone.iter().map(|r| r.patch.patch_id.clone()).collect();
        info!(
            rolled_back = ?rolled_back,
            elapsed = ?start.elapsed(),
            "patch rolled back"
        );
        let (version, cumulative_patch_id, one_offs) = self.identity_state();
        Ok(RestoredIdentity {
            patch_id: patch_id.to_string(),
            product_name: self.product_name().to_string(),
            version,
            cumulative_patch_id,
            one_offs,
            rolled_back,
            summary,
        })
    }

    fn applier(&self) -> Applier<'_> {
        Applier::new(&self.config, self.history.info(), &self.store)
    }

    fn identity_state(&self) -> (String, Option<String>, Vec<String>) {
        self.identity_layer()
            .ok()
            .and_then(|name| self.history.layer(name).ok())
            .map(|h| {
                (
                    h.baseline_version.clone(),
                    h.active_cumulative.clone(),
                    h.applied_one_offs.clone(),
                )
            })
            .unwrap_or_default()
    }

    /// Check the patch against the installation and return the layers it
    /// will be recorded on.
    fn check_applicable(&self, patch: &Patch) -> Result<Vec<String>> {
        let patch_id = patch.patch_id.as_str();
        if self.history.load_record(patch_id)?.is_some() {
            return Err(PatchError::AlreadyInstalled {
                patch_id: patch_id.to_string(),
            });
        }

        let info = self.history.info();
        let identity_layer = self.identity_layer()?;
        let expected = format!(
            "{} {}",
            patch.identity.product_name, patch.identity.product_version
        );
        let actual_at = |layer: &str| -> Result<String> {
            Ok(format!(
                "{} {}",
                info.product_name,
                self.history.current_baseline(layer)?
            ))
        };

        if patch.identity.product_name != info.product_name {
            return Err(PatchError::IdentityMismatch {
                patch_id: patch_id.to_string(),
                layer: identity_layer.to_string(),
                expected,
                actual: actual_at(identity_layer)?,
            });
        }

        for (_, m) in patch.ordered_modifications() {
            if let ContentItem::MiscFile { path } = &m.item {
                if self.config.is_reserved(&self.config.misc_path(path)) {
                    return Err(PatchError::invalid_patch(
                        patch_id,
                        format!("{} is reserved for installation metadata and modules", m.item),
                    ));
                }
            }
        }

        for element in &patch.elements {
            let layer = info
                .layer(&element.layer_name)
                .ok_or_else(|| PatchError::UnknownLayer {
                    layer: element.layer_name.clone(),
                })?;
            if layer.add_on != element.is_add_on {
                return Err(PatchError::invalid_patch(
                    patch_id,
                    format!(
                        "element {} treats {} as {}",
                        element.element_id,
                        layer.name,
                        if element.is_add_on { "an add-on" } else { "a layer" }
                    ),
                ));
            }
        }

        let layers: Vec<String> = if patch.is_cumulative() {
            info.layers.iter().map(|l| l.name.clone()).collect()
        } else {
            let mut seen = HashSet::new();
            std::iter::once(identity_layer)
                .chain(patch.elements.iter().map(|e| e.layer_name.as_str()))
                .filter(|name| seen.insert(*name))
                .map(str::to_string)
                .collect()
        };

        for layer in &layers {
            if self.history.current_baseline(layer)? != patch.identity.product_version {
                return Err(PatchError::IdentityMismatch {
                    patch_id: patch_id.to_string(),
                    layer: layer.clone(),
                    expected,
                    actual: actual_at(layer)?,
                });
            }
        }
        Ok(layers)
    }

    fn import_contents(&self, contents: &[Vec<u8>]) -> Result<()> {
        let imported = contents
            .par_iter()
            .map(|blob| self.store.put(blob))
            .collect::<Result<Vec<_>>>()?;
        debug!(blobs = imported.len(), "bundle content imported");
        Ok(())
    }

    /// Every digest the patch will materialise must resolve in the store
    /// before the tree is touched.
    fn check_content(&self, patch: &Patch) -> Result<()> {
        patch
            .ordered_modifications()
            .par_iter()
            .try_for_each(|(_, m)| self.ensure_content(m))
    }

    fn ensure_content(&self, m: &ContentModification) -> Result<()> {
        let Some(digest) = m.new_hash else {
            return Ok(());
        };
        if !self.store.has(&digest) {
            return Err(PatchError::ContentNotFound { digest });
        }
        if m.item_type() == ItemType::Module {
            let manifest = self.store.module_manifest(&digest)?;
            if let Some(entry) = manifest.entries.iter().find(|e| !self.store.has(&e.digest)) {
                return Err(PatchError::ContentNotFound {
                    digest: entry.digest,
                });
            }
        }
        Ok(())
    }

    /// Perform every modification of `patch` and record it on `layers`,
    /// journaling each step. Used for fresh applies and to reinstate
    /// patches a failed rollback chain had already removed.
    fn install(
        &mut self,
        patch: &Patch,
        layers: &[String],
        applied_at: DateTime<Utc>,
    ) -> Result<ApplySummary> {
        let mut journal = Journal::begin(&self.config, &patch.patch_id, Operation::Apply)?;
        let backups = match self.execute(patch, &mut journal) {
            Ok(backups) => backups,
            Err(e) => {
                self.finish_journal();
                return Err(e);
            }
        };

        let record = InstalledPatchRecord {
            patch: patch.clone(),
            layers: layers.to_vec(),
            applied_at,
            backups,
        };
        if let Err(e) = self.commit_apply(&record, &mut journal) {
            warn!(error = %e, "failed to record patch; reverting tree");
            let err = invert_all(&self.applier(), &record.backups, e);
            self.finish_journal();
            return Err(err);
        }
        self.finish_journal();

        let mut summary = ApplySummary::default();
        for backup in &record.backups {
            summary.record(&backup.modification);
        }
        Ok(summary)
    }

    fn execute(&self, patch: &Patch, journal: &mut Journal) -> Result<Vec<BackupRecord>> {
        let applier = self.applier();
        let mut backups = Vec::new();

        for (element, m) in patch.ordered_modifications() {
            let layer = element.map(|e| e.layer_name.as_str());
            let step = applier.prepare(&patch.patch_id, layer, m).and_then(|record| {
                journal.push(&self.config, record.clone())?;
                applier.perform(&record)?;
                Ok(record)
            });
            match step {
                Ok(record) => backups.push(record),
                Err(e) => {
                    warn!(
                        item = %m.item,
                        applied = backups.len(),
                        error = %e,
                        "modification failed; reverting"
                    );
                    return Err(invert_all(&applier, &backups, e));
                }
            }
        }
        Ok(backups)
    }

    fn commit_apply(&mut self, record: &InstalledPatchRecord, journal: &mut Journal) -> Result<()> {
        let saved = self.history.snapshot(&record.layers);
        let result = self.record_apply(record, journal);
        if result.is_err() {
            self.history.restore(saved);
            if let Err(e) = self.history.persist_layers(&record.layers) {
                error!(error = %e, "failed to restore layer history");
            }
            if let Err(e) = self.history.delete_record(&record.patch.patch_id) {
                error!(error = %e, "failed to remove patch record");
            }
        }
        result
    }

    fn record_apply(&mut self, record: &InstalledPatchRecord, journal: &mut Journal) -> Result<()> {
        for layer in &record.layers {
            if record.patch.is_cumulative() {
                self.history.record_cumulative_apply(layer, &record.patch)?;
            } else {
                self.history.record_apply(layer, &record.patch)?;
            }
        }
        journal.commit(
            &self.config,
            JournalCommit {
                layers: self.history.snapshot(&record.layers),
                record: Some(record.clone()),
            },
        )?;
        self.history.save_record(record)?;
        self.history.persist_layers(&record.layers)
    }

    fn rollback_patch(
        &mut self,
        patch_id: &str,
        rollback_to: bool,
        undone: &mut Vec<InstalledPatchRecord>,
    ) -> Result<ApplySummary> {
        let record = self
            .history
            .load_record(patch_id)?
            .ok_or_else(|| PatchError::NotInstalled {
                patch_id: patch_id.to_string(),
            })?;

        if record.patch.is_cumulative() {
            self.clear_above_cumulative(&record, rollback_to, undone)?;
        } else {
            self.clear_above_one_off(&record, rollback_to, undone)?;
        }

        debug!(
            patch_id,
            backups = record.backups.len(),
            "inverting patch"
        );
        let summary = self.uninstall(&record)?;
        undone.push(record);
        Ok(summary)
    }

    fn clear_above_one_off(
        &mut self,
        record: &InstalledPatchRecord,
        rollback_to: bool,
        undone: &mut Vec<InstalledPatchRecord>,
    ) -> Result<()> {
        let patch_id = record.patch.patch_id.as_str();
        for layer in &record.layers {
            let history = self.history.layer(layer)?;
            if history.has_one_off(patch_id) {
                continue;
            }
            return Err(match history.invalidated_by(patch_id) {
                Some(cumulative) => PatchError::Invalidated {
                    patch_id: patch_id.to_string(),
                    superseded_by: cumulative.to_string(),
                },
                None => PatchError::NotInstalled {
                    patch_id: patch_id.to_string(),
                },
            });
        }

        if rollback_to {
            // every one-off is recorded on the identity layer, so its stack
            // holds the full application order
            let identity = self.identity_layer()?.to_string();
            for newer in self.history.layer(&identity)?.one_offs_above(patch_id) {
                self.rollback_patch(&newer, false, undone)?;
            }
        }
        Ok(())
    }

    fn clear_above_cumulative(
        &mut self,
        record: &InstalledPatchRecord,
        rollback_to: bool,
        undone: &mut Vec<InstalledPatchRecord>,
    ) -> Result<()> {
        let patch_id = record.patch.patch_id.as_str();
        let identity = self.identity_layer()?.to_string();
        let layer = self.history.layer(&identity)?;
        if !layer
            .cumulative_snapshots
            .iter()
            .any(|s| s.patch_id == patch_id)
        {
            return Err(PatchError::NotInstalled {
                patch_id: patch_id.to_string(),
            });
        }

        let newer = layer.cumulatives_above(patch_id);
        if !rollback_to {
            let blocking = newer
                .first()
                .or_else(|| layer.installed_one_offs().last())
                .cloned();
            if let Some(blocking) = blocking {
                return Err(PatchError::RollbackBlocked {
                    patch_id: patch_id.to_string(),
                    blocking,
                });
            }
            return Ok(());
        }

        for cumulative in newer {
            self.rollback_patch(&cumulative, true, undone)?;
        }
        let stacked: Vec<String> = self
            .history
            .layer(&identity)?
            .installed_one_offs()
            .iter()
            .rev()
            .cloned()
            .collect();
        for one_off in stacked {
            self.rollback_patch(&one_off, false, undone)?;
        }
        Ok(())
    }

    /// Invert every backup of `record` and drop it from the history. On
    /// failure the already inverted backups are applied again.
    fn uninstall(&mut self, record: &InstalledPatchRecord) -> Result<ApplySummary> {
        let patch_id = record.patch.patch_id.as_str();
        let mut journal = Journal::begin(&self.config, patch_id, Operation::Rollback)?;
        let summary = match self.invert_patch(record, &mut journal) {
            Ok(summary) => summary,
            Err(e) => {
                self.finish_journal();
                return Err(e);
            }
        };

        let saved = self.history.snapshot(&record.layers);
        if let Err(e) = self.record_rollback(record, &mut journal) {
            warn!(error = %e, "failed to record rollback; re-applying patch");
            self.history.restore(saved);
            if let Err(e) = self.history.persist_layers(&record.layers) {
                error!(error = %e, "failed to restore layer history");
            }
            let inverted: Vec<&BackupRecord> = record.backups.iter().rev().collect();
            let err = reapply_all(&self.applier(), &inverted, e);
            self.finish_journal();
            return Err(err);
        }
        self.finish_journal();
        Ok(summary)
    }

    fn invert_patch(&self, record: &InstalledPatchRecord, journal: &mut Journal) -> Result<ApplySummary> {
        let applier = self.applier();
        let mut summary = ApplySummary::default();
        let mut inverted: Vec<&BackupRecord> = Vec::new();
        for backup in record.backups.iter().rev() {
            let step = journal
                .push(&self.config, backup.clone())
                .and_then(|_| applier.invert(backup));
            if let Err(e) = step {
                warn!(
                    item = %backup.modification.item,
                    inverted = inverted.len(),
                    error = %e,
                    "inversion failed; re-applying"
                );
                return Err(reapply_all(&applier, &inverted, e));
            }
            summary.record(&backup.modification);
            inverted.push(backup);
        }
        Ok(summary)
    }

    fn record_rollback(&mut self, record: &InstalledPatchRecord, journal: &mut Journal) -> Result<()> {
        let patch_id = record.patch.patch_id.as_str();
        for layer in &record.layers {
            if record.patch.is_cumulative() {
                self.history.record_cumulative_rollback(layer, patch_id)?;
            } else {
                self.history.record_rollback(layer, patch_id)?;
            }
        }
        journal.commit(
            &self.config,
            JournalCommit {
                layers: self.history.snapshot(&record.layers),
                record: None,
            },
        )?;
        self.history.persist_layers(&record.layers)?;
        self.history.delete_record(patch_id)
    }

    /// Install again, oldest first, the patches a failed `rollback_to`
    /// chain already removed. `undone` is in rollback order. Returns `cause`
    /// when every one of them is back, otherwise escalates.
    fn reinstate(&mut self, undone: &[InstalledPatchRecord], cause: PatchError) -> PatchError {
        warn!(
            count = undone.len(),
            error = %cause,
            "rollback chain failed; reinstating patches already rolled back"
        );
        let mut unresolved = Vec::new();
        for record in undone.iter().rev() {
            let patch_id = record.patch.patch_id.as_str();
            if let Err(e) = self.install(&record.patch, &record.layers, record.applied_at) {
                error!(patch_id, error = %e, "failed to reinstate patch");
                let applier = self.applier();
                unresolved.extend(record.backups.iter().map(|b| record_path(&applier, b)));
            }
        }
        if !unresolved.is_empty() {
            self.restart_required = true;
        }
        escalate(cause, unresolved)
    }

    fn finish_journal(&self) {
        if let Err(e) = Journal::clear(&self.config) {
            error!(error = %e, "failed to remove operation journal");
        }
    }

    /// Resolve an interrupted operation and sweep what it left behind.
    /// Skipped while another process holds the lock, since the journal and
    /// staging files then belong to its operation in flight.
    fn recover(&mut self) -> Result<()> {
        let _lock = match TreeLock::acquire(&self.config.lock_file(), "recover") {
            Ok(lock) => lock,
            Err(PatchError::Locked { holder }) => {
                debug!(%holder, "operation in flight elsewhere; not recovering");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(journal) = Journal::load(&self.config)? {
            self.history = InstallationHistory::load(&self.config)?;
            self.resume(journal)?;
            self.history = InstallationHistory::load(&self.config)?;
        }

        let swept = self.store.sweep_partials()?
            + util::sweep_stage_leftovers(&self.config.root, &self.config.metadata_dir)?;
        if swept > 0 {
            info!(swept, "removed staging leftovers");
        }
        Ok(())
    }

    /// Finish the history writes of a committed operation, or drive the tree
    /// back to where the operation found it.
    fn resume(&mut self, journal: Journal) -> Result<()> {
        let patch_id = journal.patch_id.as_str();
        if let Some(commit) = journal.commit {
            warn!(patch_id, operation = ?journal.operation, "completing interrupted operation");
            let names: Vec<String> = commit.layers.iter().map(|l| l.layer_name.clone()).collect();
            self.history.restore(commit.layers);
            self.history.persist_layers(&names)?;
            match commit.record {
                Some(record) => self.history.save_record(&record)?,
                None => self.history.delete_record(patch_id)?,
            }
            return Journal::clear(&self.config);
        }

        warn!(
            patch_id,
            operation = ?journal.operation,
            started = journal.records.len(),
            "undoing interrupted operation"
        );
        // an interrupted rollback is undone by applying its records again
        let forward = journal.operation == Operation::Rollback;
        let applier = self.applier();
        let mut cause = None;
        let mut unresolved = Vec::new();
        for record in journal.records.iter().rev() {
            if let Err(e) = applier.settle(record, forward) {
                let path = record_path(&applier, record);
                error!(path = %path.display(), error = %e, "failed to undo modification");
                unresolved.push(path);
                cause.get_or_insert(e);
            }
        }
        if let Some(cause) = cause {
            return Err(escalate(cause, unresolved));
        }
        Journal::clear(&self.config)
    }
}

/// Undo `applied` newest first. Returns `cause` when the tree is back to its
/// previous state, otherwise escalates with every path left behind.
fn invert_all(applier: &Applier<'_>, applied: &[BackupRecord], cause: PatchError) -> PatchError {
    let mut unresolved = Vec::new();
    for record in applied.iter().rev() {
        if let Err(e) = applier.invert(record) {
            let path = record_path(applier, record);
            error!(path = %path.display(), error = %e, "failed to revert modification");
            unresolved.push(path);
        }
    }
    escalate(cause, unresolved)
}

/// Apply again what a failed rollback already inverted. `inverted` is in
/// inversion order, so it is replayed back to front.
fn reapply_all(applier: &Applier<'_>, inverted: &[&BackupRecord], cause: PatchError) -> PatchError {
    let mut unresolved = Vec::new();
    for record in inverted.iter().rev() {
        let layer = record.layer.as_deref();
        if let Err(e) = applier.apply(&record.patch_id, layer, &record.modification) {
            let path = record_path(applier, record);
            error!(path = %path.display(), error = %e, "failed to re-apply modification");
            unresolved.push(path);
        }
    }
    escalate(cause, unresolved)
}

fn escalate(cause: PatchError, unresolved: Vec<PathBuf>) -> PatchError {
    if unresolved.is_empty() {
        cause
    } else {
        PatchError::IrrecoverableState {
            cause: Box::new(cause),
            paths: unresolved,
        }
    }
}

fn record_path(applier: &Applier<'_>, record: &BackupRecord) -> PathBuf {
    let item = &record.modification.item;
    applier
        .target_path(&record.patch_id, record.layer.as_deref(), item)
        .unwrap_or_else(|_| PathBuf::from(item.to_string()))
}

fn validate_layers(layers: &[LayerInfo]) -> Result<()> {
    let mut seen = HashSet::new();
    for layer in layers {
        let name = layer.name.as_str();
        let plain = !name.trim().is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\']);
        if !plain || !seen.insert(name) {
            return Err(PatchError::codec(
                "initialise installation",
                format!("invalid or duplicate layer name {name:?}"),
            ));
        }
    }
    Ok(())
}
