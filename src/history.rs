//! Durable record of what is installed, per layer.
//!
//! Each layer keeps its baseline version, the stack of one-off patches on top
//! of it, and one snapshot per cumulative patch so a cumulative rollback can
//! restore exactly what that patch superseded. Everything lives under the
//! metadata directory as small JSON files written stage-then-rename:
//!
//! ```text
//! .installation/
//!   installation.json       product name and declared layers
//!   layers/<layer>.json     LayerHistory
//!   patches/<patch-id>.json InstalledPatchRecord (incl. backup records)
//!   journal.json            operation in flight, see crate::journal
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use crate::applier::BackupRecord;
use crate::config::EngineConfig;
use crate::error::{IoResultExt, PatchError, Result};
use crate::patch_format::{Patch, PatchType};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub add_on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationInfo {
    pub product_name: String,
    pub layers: Vec<LayerInfo>,
}

impl InstallationInfo {
    /// The layer that carries identity-level patches (the first base layer).
    pub fn identity_layer(&self) -> Option<&LayerInfo> {
        self.layers.iter().find(|l| !l.add_on)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerInfo> {
        self.layers.iter().find(|l| l.name == name)
    }
}

/// State captured right before a cumulative patch replaced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeSnapshot {
    pub patch_id: String,
    pub prior_baseline: String,
    pub prior_cumulative: Option<String>,
    pub prior_one_offs: Vec<String>,
    pub prior_ancestry: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerHistory {
    pub layer_name: String,
    pub add_on: bool,
    pub baseline_version: String,
    /// Most recent cumulative patch, if any.
    pub active_cumulative: Option<String>,
    /// Installed one-offs in application order.
    pub applied_one_offs: Vec<String>,
    /// Baseline each one-off was applied on.
    pub ancestry: BTreeMap<String, String>,
    /// Oldest first; only the last entry may be rolled back.
    pub cumulative_snapshots: Vec<CumulativeSnapshot>,
}

impl LayerHistory {
    pub fn new(layer: &LayerInfo, baseline: &str) -> Self {
        Self {
            layer_name: layer.name.clone(),
            add_on: layer.add_on,
            baseline_version: baseline.to_string(),
            active_cumulative: None,
            applied_one_offs: Vec::new(),
            ancestry: BTreeMap::new(),
            cumulative_snapshots: Vec::new(),
        }
    }

    pub fn current_baseline(&self) -> &str {
        &self.baseline_version
    }

    pub fn installed_one_offs(&self) -> &[String] {
        &self.applied_one_offs
    }

    pub fn has_one_off(&self, patch_id: &str) -> bool {
        self.applied_one_offs.iter().any(|p| p == patch_id)
    }

    pub fn record_apply(&mut self, patch_id: &str) {
        if !self.has_one_off(patch_id) {
            self.applied_one_offs.push(patch_id.to_string());
            self.ancestry
                .insert(patch_id.to_string(), self.baseline_version.clone());
        }
    }

    pub fn record_rollback(&mut self, patch_id: &str) -> Result<()> {
        let pos = self
            .applied_one_offs
            .iter()
            .position(|p| p == patch_id)
            .ok_or_else(|| PatchError::NotInstalled {
                patch_id: patch_id.to_string(),
            })?;
        self.applied_one_offs.remove(pos);
        self.ancestry.remove(patch_id);
        Ok(())
    }

    /// Replace the baseline and supersede every installed one-off.
    pub fn record_cumulative_apply(&mut self, patch_id: &str, resulting_version: &str) {
        self.cumulative_snapshots.push(CumulativeSnapshot {
            patch_id: patch_id.to_string(),
            prior_baseline: std::mem::replace(
                &mut self.baseline_version,
                resulting_version.to_string(),
            ),
            prior_cumulative: self.active_cumulative.replace(patch_id.to_string()),
            prior_one_offs: std::mem::take(&mut self.applied_one_offs),
            prior_ancestry: std::mem::take(&mut self.ancestry),
        });
    }

    /// Restore the state captured before `patch_id` was applied. Only the
    /// newest cumulative patch can be undone.
    pub fn record_cumulative_rollback(&mut self, patch_id: &str) -> Result<()> {
        match self.cumulative_snapshots.last() {
            Some(top) if top.patch_id == patch_id => {}
            Some(top) if self.cumulative_snapshots.iter().any(|s| s.patch_id == patch_id) => {
                return Err(PatchError::RollbackBlocked {
                    patch_id: patch_id.to_string(),
                    blocking: top.patch_id.clone(),
                })
            }
            _ => {
                return Err(PatchError::NotInstalled {
                    patch_id: patch_id.to_string(),
                })
            }
        }
        if let Some(blocking) = self.applied_one_offs.last() {
            return Err(PatchError::RollbackBlocked {
                patch_id: patch_id.to_string(),
                blocking: blocking.clone(),
            });
        }
        if let Some(snapshot) = self.cumulative_snapshots.pop() {
            self.baseline_version = snapshot.prior_baseline;
            self.active_cumulative = snapshot.prior_cumulative;
            self.applied_one_offs = snapshot.prior_one_offs;
            self.ancestry = snapshot.prior_ancestry;
        }
        Ok(())
    }

    /// Cumulative patch that superseded `patch_id`, if it was superseded.
    pub fn invalidated_by(&self, patch_id: &str) -> Option<&str> {
        self.cumulative_snapshots
            .iter()
            .find(|s| s.prior_one_offs.iter().any(|p| p == patch_id))
            .map(|s| s.patch_id.as_str())
    }

    /// Cumulative patches applied after `patch_id`, newest first.
    pub fn cumulatives_above(&self, patch_id: &str) -> Vec<String> {
        match self
            .cumulative_snapshots
            .iter()
            .position(|s| s.patch_id == patch_id)
        {
            Some(pos) => self.cumulative_snapshots[pos + 1..]
                .iter()
                .rev()
                .map(|s| s.patch_id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// One-offs applied after `patch_id`, newest first.
    pub fn one_offs_above(&self, patch_id: &str) -> Vec<String> {
        match self.applied_one_offs.iter().position(|p| p == patch_id) {
            Some(pos) => self.applied_one_offs[pos + 1..].iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Everything needed to undo a patch, persisted while it is installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledPatchRecord {
    pub patch: Patch,
    pub layers: Vec<String>,
    pub applied_at: DateTime<Utc>,
    /// One per modification performed, in application order.
    pub backups: Vec<BackupRecord>,
}

/// Row of [`InstallationHistory::list_installed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPatch {
    pub patch_id: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub cumulative: bool,
}

#[derive(Debug)]
pub struct InstallationHistory {
    config: EngineConfig,
    info: InstallationInfo,
    layers: BTreeMap<String, LayerHistory>,
}

impl InstallationHistory {
    /// Write a fresh installation record with every layer at `version`.
    pub fn create(config: &EngineConfig, info: InstallationInfo, version: &str) -> Result<Self> {
        for dir in [config.layers_dir(), config.patches_dir()] {
            fs::create_dir_all(&dir).at(&dir)?;
        }
        let layers = info
            .layers
            .iter()
            .map(|l| (l.name.clone(), LayerHistory::new(l, version)))
            .collect();
        let history = Self {
            config: config.clone(),
            info,
            layers,
        };
        write_json(&config.installation_file(), &history.info, config.fsync)?;
        let names: Vec<String> = history.layers.keys().cloned().collect();
        history.persist_layers(&names)?;
        Ok(history)
    }

    pub fn load(config: &EngineConfig) -> Result<Self> {
        let info: InstallationInfo = read_json(&config.installation_file())?.ok_or_else(|| {
            PatchError::NotInitialized {
                path: config.metadata_dir.clone(),
            }
        })?;
        let mut layers = BTreeMap::new();
        for layer in &info.layers {
            let path = config.layer_file(&layer.name);
            let history: LayerHistory = read_json(&path)?.ok_or_else(|| {
                PatchError::codec("load layer history", format!("{} is missing", path.display()))
            })?;
            layers.insert(layer.name.clone(), history);
        }
        debug!(layers = layers.len(), "installation history loaded");
        Ok(Self {
            config: config.clone(),
            info,
            layers,
        })
    }

    pub fn info(&self) -> &InstallationInfo {
        &self.info
    }

    pub fn layer(&self, name: &str) -> Result<&LayerHistory> {
        self.layers.get(name).ok_or_else(|| PatchError::UnknownLayer {
            layer: name.to_string(),
        })
    }

    pub fn layer_mut(&mut self, name: &str) -> Result<&mut LayerHistory> {
        self.layers
            .get_mut(name)
            .ok_or_else(|| PatchError::UnknownLayer {
                layer: name.to_string(),
            })
    }

    pub fn current_baseline(&self, layer: &str) -> Result<&str> {
        Ok(self.layer(layer)?.current_baseline())
    }

    pub fn installed_one_offs(&self, layer: &str) -> Result<&[String]> {
        Ok(self.layer(layer)?.installed_one_offs())
    }

    pub fn record_apply(&mut self, layer: &str, patch: &Patch) -> Result<()> {
        self.layer_mut(layer)?.record_apply(&patch.patch_id);
        Ok(())
    }

    pub fn record_rollback(&mut self, layer: &str, patch_id: &str) -> Result<()> {
        self.layer_mut(layer)?.record_rollback(patch_id)
    }

    pub fn record_cumulative_apply(&mut self, layer: &str, patch: &Patch) -> Result<()> {
        let PatchType::Cumulative { resulting_version } = &patch.identity.patch_type else {
            return Err(PatchError::invalid_patch(
                &patch.patch_id,
                "not a cumulative patch",
            ));
        };
        self.layer_mut(layer)?
            .record_cumulative_apply(&patch.patch_id, resulting_version);
        Ok(())
    }

    pub fn record_cumulative_rollback(&mut self, layer: &str, patch_id: &str) -> Result<()> {
        self.layer_mut(layer)?.record_cumulative_rollback(patch_id)
    }

    /// Copy of the named layers, for restoring after a failed operation.
    pub fn snapshot(&self, names: &[String]) -> Vec<LayerHistory> {
        names
            .iter()
            .filter_map(|n| self.layers.get(n).cloned())
            .collect()
    }

    pub fn restore(&mut self, saved: Vec<LayerHistory>) {
        for layer in saved {
            self.layers.insert(layer.layer_name.clone(), layer);
        }
    }

    pub fn persist_layers(&self, names: &[String]) -> Result<()> {
        for name in names {
            let layer = self.layer(name)?;
            write_json(&self.config.layer_file(name), layer, self.config.fsync)?;
        }
        Ok(())
    }

    pub fn save_record(&self, record: &InstalledPatchRecord) -> Result<()> {
        write_json(
            &self.config.patch_record_file(&record.patch.patch_id),
            record,
            self.config.fsync,
        )
    }

    pub fn load_record(&self, patch_id: &str) -> Result<Option<InstalledPatchRecord>> {
        read_json(&self.config.patch_record_file(patch_id))
    }

    pub fn delete_record(&self, patch_id: &str) -> Result<()> {
        let path = self.config.patch_record_file(patch_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PatchError::io(path, e)),
        }
    }

    /// Active cumulative patch (if any) followed by the one-offs on top of it.
    pub fn list_installed(&self, layer: &str) -> Result<Vec<InstalledPatch>> {
        let history = self.layer(layer)?;
        let ids = history
            .active_cumulative
            .iter()
            .chain(history.applied_one_offs.iter());
        let mut rows = Vec::new();
        for id in ids {
            let record = self.load_record(id)?.ok_or_else(|| {
                PatchError::codec("list installed patches", format!("record for {id} is missing"))
            })?;
            rows.push(InstalledPatch {
                patch_id: id.clone(),
                description: record.patch.description.clone(),
                applied_at: record.applied_at,
                cumulative: record.patch.is_cumulative(),
            });
        }
        Ok(rows)
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T, fsync: bool) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PatchError::codec(format!("encode {}", path.display()), e))?;
    util::write_atomic(path, &bytes, fsync)
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PatchError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PatchError::codec(format!("decode {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> LayerInfo {
        LayerInfo {
            name: "base".into(),
            add_on: false,
        }
    }

    #[test]
    fn test_one_off_rollback_any_order() {
        let mut layer = LayerHistory::new(&base(), "1.0");
        layer.record_apply("p1");
        layer.record_apply("p2");
        layer.record_apply("p3");
        layer.record_rollback("p2").unwrap();
        assert_eq!(layer.installed_one_offs(), ["p1", "p3"]);
        assert!(matches!(
            layer.record_rollback("p2"),
            Err(PatchError::NotInstalled { .. })
        ));
    }

    #[test]
    fn test_cumulative_supersedes_and_restores() {
        let mut layer = LayerHistory::new(&base(), "1.0");
        layer.record_apply("o1");
        layer.record_apply("o2");
        layer.record_cumulative_apply("cp1", "1.1");

        assert_eq!(layer.current_baseline(), "1.1");
        assert!(layer.installed_one_offs().is_empty());
        assert_eq!(layer.invalidated_by("o1"), Some("cp1"));
        assert_eq!(layer.invalidated_by("o3"), None);

        layer.record_cumulative_rollback("cp1").unwrap();
        assert_eq!(layer.current_baseline(), "1.0");
        assert_eq!(layer.installed_one_offs(), ["o1", "o2"]);
        assert_eq!(layer.ancestry.get("o1").map(String::as_str), Some("1.0"));
        assert_eq!(layer.active_cumulative, None);
    }

    #[test]
    fn test_only_newest_cumulative_rolls_back() {
        let mut layer = LayerHistory::new(&base(), "1.0");
        layer.record_cumulative_apply("cp1", "1.1");
        layer.record_cumulative_apply("cp2", "1.2");
        let err = layer.record_cumulative_rollback("cp1").unwrap_err();
        assert!(matches!(err, PatchError::RollbackBlocked { ref blocking, .. } if blocking == "cp2"));
        assert_eq!(layer.cumulatives_above("cp1"), vec!["cp2"]);

        layer.record_cumulative_rollback("cp2").unwrap();
        layer.record_cumulative_rollback("cp1").unwrap();
        assert_eq!(layer.current_baseline(), "1.0");
    }

    #[test]
    fn test_one_off_on_top_blocks_cumulative_rollback() {
        let mut layer = LayerHistory::new(&base(), "1.0");
        layer.record_cumulative_apply("cp1", "1.1");
        layer.record_apply("o1");
        assert!(matches!(
            layer.record_cumulative_rollback("cp1"),
            Err(PatchError::RollbackBlocked { .. })
        ));
    }

    #[test]
    fn test_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::new(temp.path()).with_fsync(false);
        let info = InstallationInfo {
            product_name: "WildFly".into(),
            layers: vec![base()],
        };
        let mut history = InstallationHistory::create(&config, info, "1.0").unwrap();
        history.layer_mut("base").unwrap().record_apply("p1");
        history.persist_layers(&["base".to_string()]).unwrap();

        let loaded = InstallationHistory::load(&config).unwrap();
        assert_eq!(loaded.installed_one_offs("base").unwrap(), ["p1"]);
        assert_eq!(loaded.current_baseline("base").unwrap(), "1.0");
        assert!(matches!(
            loaded.layer("nope"),
            Err(PatchError::UnknownLayer { .. })
        ));
    }

    #[test]
    fn test_load_uninitialised() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig::new(temp.path());
        assert!(matches!(
            InstallationHistory::load(&config),
            Err(PatchError::NotInitialized { .. })
        ));
    }
}
