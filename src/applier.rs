use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::content_store::{self, ContentStore};
use crate::digest::Digest;
use crate::error::{IoResultExt, PatchError, Result};
use crate::history::InstallationInfo;
use crate::patch_format::{ContentItem, ContentModification, ModificationType};
use crate::util;

/// What one applied modification replaced, enough to invert it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub patch_id: String,
    /// Layer of the owning element; `None` for top-level misc files.
    pub layer: Option<String>,
    pub modification: ContentModification,
    /// Digest of the content that was in place before, `None` if the target
    /// was absent. The bytes are retained in the content store.
    pub prior: Option<Digest>,
    /// Directories created to host the target, relative to the root.
    #[serde(default)]
    pub created_dirs: Vec<PathBuf>,
}

/// Executes and inverts single [`ContentModification`]s against the live tree.
pub struct Applier<'a> {
    config: &'a EngineConfig,
    info: &'a InstallationInfo,
    store: &'a ContentStore,
}

impl<'a> Applier<'a> {
    pub fn new(config: &'a EngineConfig, info: &'a InstallationInfo, store: &'a ContentStore) -> Self {
        Self {
            config,
            info,
            store,
        }
    }

    /// Absolute path a modification acts on.
    pub fn target_path(&self, patch_id: &str, layer: Option<&str>, item: &ContentItem) -> Result<PathBuf> {
        match item {
            ContentItem::MiscFile { path } => Ok(self.config.misc_path(path)),
            ContentItem::Module { name, slot } => {
                let layer = layer.ok_or_else(|| {
                    PatchError::invalid_patch(patch_id, format!("{item} has no owning layer"))
                })?;
                let info = self.info.layer(layer).ok_or_else(|| PatchError::UnknownLayer {
                    layer: layer.to_string(),
                })?;
                Ok(self.config.module_dir(&info.name, info.add_on, name, slot))
            }
        }
    }

    /// Digest of whatever currently occupies `path`; directories hash as modules.
    pub fn live_digest(&self, path: &Path) -> Result<Option<Digest>> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(Some(content_store::module_dir_digest(path)?)),
            Ok(meta) => Ok(Some(util::hash_file(path, meta.len())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PatchError::io(path, e)),
        }
    }

    /// Apply one modification, returning the record that undoes it.
    pub fn apply(
        &self,
        patch_id: &str,
        layer: Option<&str>,
        modification: &ContentModification,
    ) -> Result<BackupRecord> {
        let record = self.prepare(patch_id, layer, modification)?;
        self.perform(&record)?;
        Ok(record)
    }

    /// Check one modification against the live tree and back up what it
    /// will replace, without touching the tree. The returned record is
    /// complete before [`Applier::perform`] runs, so it can be journaled.
    pub fn prepare(
        &self,
        patch_id: &str,
        layer: Option<&str>,
        modification: &ContentModification,
    ) -> Result<BackupRecord> {
        let item = &modification.item;
        let path = self.target_path(patch_id, layer, item)?;
        let live = self.live_digest(&path)?;
        let mut record = BackupRecord {
            patch_id: patch_id.to_string(),
            layer: layer.map(str::to_string),
            modification: modification.clone(),
            prior: None,
            created_dirs: Vec::new(),
        };

        match modification.modification_type {
            ModificationType::Add => {
                let new = required(patch_id, item, modification.new_hash)?;
                match live {
                    Some(actual) if actual == new => {
                        debug!(%item, "content already present, nothing to add");
                        record.prior = Some(actual);
                    }
                    Some(actual) => return Err(PatchError::AlreadyExists { path, actual }),
                    None => record.created_dirs = util::missing_parents(&self.config.root, &path),
                }
            }
            ModificationType::Modify | ModificationType::Remove => {
                if live != modification.existing_hash {
                    return Err(PatchError::DriftDetected {
                        path,
                        expected: modification.existing_hash,
                        actual: live,
                    });
                }
                if modification.modification_type == ModificationType::Modify {
                    required(patch_id, item, modification.new_hash)?;
                }
                record.prior = Some(self.backup(item, &path)?);
            }
        }
        Ok(record)
    }

    /// Carry out a modification checked by [`Applier::prepare`].
    pub fn perform(&self, record: &BackupRecord) -> Result<()> {
        let m = &record.modification;
        let item = &m.item;
        let path = self.target_path(&record.patch_id, record.layer.as_deref(), item)?;

        match (m.modification_type, m.new_hash) {
            // identical content was already in place
            (ModificationType::Add, _) if record.prior.is_some() => {}
            (ModificationType::Add | ModificationType::Modify, Some(new)) => {
                self.write_content(item, &path, &new)?;
            }
            (ModificationType::Remove, _) => self.remove_content(item, &path)?,
            (_, None) => {
                return Err(PatchError::invalid_patch(
                    &record.patch_id,
                    format!("{item} has no new content"),
                ))
            }
        }

        trace!(%item, kind = ?m.modification_type, "modification applied");
        Ok(())
    }

    /// Undo a previously applied modification.
    ///
    /// The live content must still be what the modification left behind;
    /// anything else means the tree changed out of band and is reported.
    pub fn invert(&self, record: &BackupRecord) -> Result<()> {
        let m = &record.modification;
        let item = &m.item;
        let path = self.target_path(&record.patch_id, record.layer.as_deref(), item)?;
        let live = self.live_digest(&path)?;

        match m.modification_type {
            ModificationType::Add | ModificationType::Modify => {
                if live != m.new_hash {
                    return Err(PatchError::DriftDetected {
                        path,
                        expected: m.new_hash,
                        actual: live,
                    });
                }
            }
            ModificationType::Remove => match live {
                None => {}
                Some(actual) if Some(actual) == record.prior => {
                    debug!(%item, "removed content already back in place");
                    return Ok(());
                }
                Some(actual) => return Err(PatchError::UnexpectedPresence { path, actual }),
            },
        }

        match record.prior {
            Some(prior) if Some(prior) == live => {}
            Some(prior) => {
                self.write_content(item, &path, &prior)?;
            }
            None => self.remove_content(item, &path)?,
        }
        util::remove_created_dirs(&self.config.root, &record.created_dirs)?;

        trace!(%item, kind = ?m.modification_type, "modification inverted");
        Ok(())
    }

    /// Drive the target of `record` to one end of its modification after an
    /// interrupted operation: the new content when `forward`, the prior
    /// content otherwise. The live content may already sit at either end,
    /// or be absent when a directory swap was cut short. Anything else was
    /// changed out of band and is reported as drift.
    pub fn settle(&self, record: &BackupRecord, forward: bool) -> Result<()> {
        let m = &record.modification;
        let item = &m.item;
        let path = self.target_path(&record.patch_id, record.layer.as_deref(), item)?;
        let live = self.live_digest(&path)?;
        let (wanted, other) = if forward {
            (m.new_hash, record.prior)
        } else {
            (record.prior, m.new_hash)
        };

        if live != wanted {
            if live.is_some() && live != other {
                return Err(PatchError::DriftDetected {
                    path,
                    expected: wanted,
                    actual: live,
                });
            }
            match wanted {
                Some(digest) => {
                    self.write_content(item, &path, &digest)?;
                }
                None => self.remove_content(item, &path)?,
            }
        }
        if !forward {
            util::remove_created_dirs(&self.config.root, &record.created_dirs)?;
        }

        debug!(%item, forward, "modification settled");
        Ok(())
    }

    /// Copy the current content of `path` into the store.
    fn backup(&self, item: &ContentItem, path: &Path) -> Result<Digest> {
        let digest = if path.is_dir() {
            self.store.put_module_dir(path)?
        } else {
            self.store.put(&util::read_file(path)?)?
        };
        debug!(%item, digest = %digest.short(), "backed up prior content");
        Ok(digest)
    }

    /// Materialise `digest` at `path` via stage-then-rename.
    fn write_content(&self, item: &ContentItem, path: &Path, digest: &Digest) -> Result<Vec<PathBuf>> {
        let created = util::create_parents(&self.config.root, path)?;
        let result = match item {
            ContentItem::MiscFile { .. } => {
                let data = self.store.get(digest)?;
                util::write_atomic(path, &data, self.config.fsync)
            }
            ContentItem::Module { .. } => self.write_module(path, digest),
        };
        if let Err(e) = result {
            if let Err(cleanup) = util::remove_created_dirs(&self.config.root, &created) {
                warn!(
                    path = %path.display(),
                    error = %cleanup,
                    "failed to remove created directories"
                );
            }
            return Err(e);
        }
        Ok(created)
    }

    fn write_module(&self, path: &Path, digest: &Digest) -> Result<()> {
        let manifest = self.store.module_manifest(digest)?;
        let staged = util::stage_path(path);
        let result = (|| -> Result<()> {
            fs::create_dir(&staged).at(&staged)?;
            for entry in &manifest.entries {
                let target = module_entry_path(&staged, &entry.path)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).at(parent)?;
                }
                let data = self.store.get(&entry.digest)?;
                util::write_atomic(&target, &data, self.config.fsync)?;
            }
            util::swap_dir(&staged, path)
        })();
        if result.is_err() && staged.exists() {
            if let Err(e) = fs::remove_dir_all(&staged) {
                warn!(path = %staged.display(), error = %e, "failed to remove staged module");
            }
        }
        result
    }

    fn remove_content(&self, item: &ContentItem, path: &Path) -> Result<()> {
        match item {
            ContentItem::MiscFile { .. } if !path.is_dir() => fs::remove_file(path).at(path),
            _ => util::remove_dir_atomic(path),
        }
    }
}

fn required(patch_id: &str, item: &ContentItem, digest: Option<Digest>) -> Result<Digest> {
    digest.ok_or_else(|| PatchError::invalid_patch(patch_id, format!("{item} has no new content")))
}

/// Resolve a manifest entry below `root`, refusing anything that escapes it.
fn module_entry_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(PatchError::codec(
                "resolve module entry",
                format!("unsafe entry path {relative}"),
            ));
        }
        path.push(part);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::LayerInfo;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        config: EngineConfig,
        info: InstallationInfo,
        store: ContentStore,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let config = EngineConfig::new(temp.path()).with_fsync(false);
            let store = ContentStore::open(config.content_dir(), false).unwrap();
            let info = InstallationInfo {
                product_name: "WildFly".into(),
                layers: vec![LayerInfo {
                    name: "base".into(),
                    add_on: false,
                }],
            };
            Self {
                _temp: temp,
                config,
                info,
                store,
            }
        }

        fn applier(&self) -> Applier<'_> {
            Applier::new(&self.config, &self.info, &self.store)
        }

        fn root(&self) -> &Path {
            &self.config.root
        }
    }

    fn misc(path: &[&str]) -> ContentItem {
        ContentItem::MiscFile {
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_add_and_invert_file() {
        let fx = Fixture::new();
        let new = fx.store.put(b"Hello World!").unwrap();
        let m = ContentModification::add(misc(&["awesomeDirectory", "awesomeFile"]), new);

        let record = fx.applier().apply("p1", None, &m).unwrap();
        let file = fx.root().join("awesomeDirectory/awesomeFile");
        assert_eq!(fs::read(&file).unwrap(), b"Hello World!");
        assert_eq!(record.prior, None);
        assert_eq!(record.created_dirs, vec![PathBuf::from("awesomeDirectory")]);

        fx.applier().invert(&record).unwrap();
        assert!(!file.exists());
        assert!(!fx.root().join("awesomeDirectory").exists());
    }

    #[test]
    fn test_add_existing_identical_is_noop() {
        let fx = Fixture::new();
        fs::write(fx.root().join("same.txt"), b"same").unwrap();
        let new = fx.store.put(b"same").unwrap();
        let m = ContentModification::add(misc(&["same.txt"]), new);

        let record = fx.applier().apply("p1", None, &m).unwrap();
        assert_eq!(record.prior, Some(new));
        // inverting leaves the pre-existing file alone
        fx.applier().invert(&record).unwrap();
        assert_eq!(fs::read(fx.root().join("same.txt")).unwrap(), b"same");
    }

    #[test]
    fn test_add_over_different_content_fails() {
        let fx = Fixture::new();
        fs::write(fx.root().join("taken.txt"), b"mine").unwrap();
        let new = fx.store.put(b"theirs").unwrap();
        let m = ContentModification::add(misc(&["taken.txt"]), new);
        let err = fx.applier().apply("p1", None, &m).unwrap_err();
        assert!(matches!(err, PatchError::AlreadyExists { .. }));
        assert_eq!(fs::read(fx.root().join("taken.txt")).unwrap(), b"mine");
    }

    #[test]
    fn test_modify_detects_drift() {
        let fx = Fixture::new();
        fs::write(fx.root().join("conf.xml"), b"edited by hand").unwrap();
        let new = fx.store.put(b"patched").unwrap();
        let m = ContentModification::modify(misc(&["conf.xml"]), Digest::of(b"original"), new);

        let err = fx.applier().apply("p1", None, &m).unwrap_err();
        match err {
            PatchError::DriftDetected {
                expected, actual, ..
            } => {
                assert_eq!(expected, Some(Digest::of(b"original")));
                assert_eq!(actual, Some(Digest::of(b"edited by hand")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"edited by hand");
    }

    #[test]
    fn test_modify_then_invert_restores_backup() {
        let fx = Fixture::new();
        fs::write(fx.root().join("conf.xml"), b"original").unwrap();
        let new = fx.store.put(b"patched").unwrap();
        let m = ContentModification::modify(misc(&["conf.xml"]), Digest::of(b"original"), new);

        let record = fx.applier().apply("p1", None, &m).unwrap();
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"patched");
        assert!(fx.store.has(&Digest::of(b"original")));

        fx.applier().invert(&record).unwrap();
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"original");
    }

    #[test]
    fn test_invert_modify_refuses_when_changed_after_install() {
        let fx = Fixture::new();
        fs::write(fx.root().join("conf.xml"), b"original").unwrap();
        let new = fx.store.put(b"patched").unwrap();
        let m = ContentModification::modify(misc(&["conf.xml"]), Digest::of(b"original"), new);
        let record = fx.applier().apply("p1", None, &m).unwrap();

        fs::write(fx.root().join("conf.xml"), b"tweaked later").unwrap();
        let err = fx.applier().invert(&record).unwrap_err();
        assert!(matches!(err, PatchError::DriftDetected { .. }));
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"tweaked later");
    }

    #[test]
    fn test_remove_and_unexpected_presence() {
        let fx = Fixture::new();
        fs::write(fx.root().join("old.txt"), b"old").unwrap();
        let m = ContentModification::remove(misc(&["old.txt"]), Digest::of(b"old"));
        let record = fx.applier().apply("p1", None, &m).unwrap();
        assert!(!fx.root().join("old.txt").exists());

        fs::write(fx.root().join("old.txt"), b"squatter").unwrap();
        let err = fx.applier().invert(&record).unwrap_err();
        assert!(matches!(err, PatchError::UnexpectedPresence { .. }));

        fs::remove_file(fx.root().join("old.txt")).unwrap();
        fx.applier().invert(&record).unwrap();
        assert_eq!(fs::read(fx.root().join("old.txt")).unwrap(), b"old");
    }

    #[test]
    fn test_module_add_modify_remove() {
        let fx = Fixture::new();
        let item = ContentItem::Module {
            name: "org.wildfly.awesomemodule".into(),
            slot: "main".into(),
        };
        let v1 = fx
            .store
            .put_module(&[("testFile1", b"content1"), ("testFile2", b"content2")])
            .unwrap();
        let v2 = fx
            .store
            .put_module(&[("testFile1", b"content1"), ("lib/extra.jar", b"jarbytes")])
            .unwrap();
        let dir = fx
            .config
            .module_dir("base", false, "org.wildfly.awesomemodule", "main");

        let add = fx
            .applier()
            .apply("p1", Some("base"), &ContentModification::add(item.clone(), v1))
            .unwrap();
        assert_eq!(fs::read(dir.join("testFile2")).unwrap(), b"content2");

        let modify = fx
            .applier()
            .apply("p2", Some("base"), &ContentModification::modify(item.clone(), v1, v2))
            .unwrap();
        assert!(!dir.join("testFile2").exists());
        assert_eq!(fs::read(dir.join("lib/extra.jar")).unwrap(), b"jarbytes");

        fx.applier().invert(&modify).unwrap();
        assert_eq!(content_store::module_dir_digest(&dir).unwrap(), v1);

        let remove = fx
            .applier()
            .apply("p3", Some("base"), &ContentModification::remove(item, v1))
            .unwrap();
        assert!(!dir.exists());
        fx.applier().invert(&remove).unwrap();
        assert_eq!(content_store::module_dir_digest(&dir).unwrap(), v1);

        fx.applier().invert(&remove).unwrap();
        fx.applier().invert(&add).unwrap();
        assert!(!fx.root().join("modules").exists());
    }

    #[test]
    fn test_prepare_does_not_touch_tree() {
        let fx = Fixture::new();
        fs::write(fx.root().join("conf.xml"), b"original").unwrap();
        let new = fx.store.put(b"patched").unwrap();
        let m = ContentModification::modify(misc(&["conf.xml"]), Digest::of(b"original"), new);
        let added = ContentModification::add(misc(&["a", "b", "new.txt"]), new);

        let record = fx.applier().prepare("p1", None, &m).unwrap();
        assert_eq!(record.prior, Some(Digest::of(b"original")));
        assert!(fx.store.has(&Digest::of(b"original")));
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"original");

        let pending = fx.applier().prepare("p1", None, &added).unwrap();
        assert_eq!(
            pending.created_dirs,
            vec![PathBuf::from("a"), PathBuf::from("a/b")]
        );
        assert!(!fx.root().join("a").exists());

        fx.applier().perform(&record).unwrap();
        fx.applier().perform(&pending).unwrap();
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"patched");
        assert_eq!(fs::read(fx.root().join("a/b/new.txt")).unwrap(), b"patched");
    }

    #[test]
    fn test_settle_accepts_either_end() {
        let fx = Fixture::new();
        fs::write(fx.root().join("conf.xml"), b"original").unwrap();
        let new = fx.store.put(b"patched").unwrap();
        let m = ContentModification::modify(misc(&["conf.xml"]), Digest::of(b"original"), new);
        let added = ContentModification::add(misc(&["fresh", "new.txt"]), new);

        // prepared but never performed
        let record = fx.applier().prepare("p1", None, &m).unwrap();
        let pending = fx.applier().prepare("p1", None, &added).unwrap();
        fx.applier().settle(&record, false).unwrap();
        fx.applier().settle(&pending, false).unwrap();
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"original");
        assert!(!fx.root().join("fresh").exists());

        // performed, then driven back and forth
        fx.applier().perform(&pending).unwrap();
        fx.applier().perform(&record).unwrap();
        fx.applier().settle(&record, false).unwrap();
        fx.applier().settle(&pending, false).unwrap();
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"original");
        assert!(!fx.root().join("fresh").exists());

        fx.applier().settle(&record, true).unwrap();
        fx.applier().settle(&record, true).unwrap();
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"patched");

        fs::write(fx.root().join("conf.xml"), b"edited by hand").unwrap();
        assert!(matches!(
            fx.applier().settle(&record, false),
            Err(PatchError::DriftDetected { .. })
        ));
        assert_eq!(fs::read(fx.root().join("conf.xml")).unwrap(), b"edited by hand");
    }

    #[test]
    fn test_settle_restores_module_cut_mid_swap() {
        let fx = Fixture::new();
        let item = ContentItem::Module {
            name: "org.wildfly.awesomemodule".into(),
            slot: "main".into(),
        };
        let v1 = fx.store.put_module(&[("testFile1", b"content1")]).unwrap();
        let v2 = fx.store.put_module(&[("testFile1", b"content2")]).unwrap();
        fx.applier()
            .apply("p0", Some("base"), &ContentModification::add(item.clone(), v1))
            .unwrap();
        let dir = fx
            .config
            .module_dir("base", false, "org.wildfly.awesomemodule", "main");

        let record = fx
            .applier()
            .prepare("p1", Some("base"), &ContentModification::modify(item, v1, v2))
            .unwrap();
        // the old directory was renamed aside and the new one never landed
        fs::rename(&dir, util::stage_path(&dir)).unwrap();
        assert!(!dir.exists());

        fx.applier().settle(&record, false).unwrap();
        assert_eq!(content_store::module_dir_digest(&dir).unwrap(), v1);
    }

    #[test]
    fn test_failed_write_cleans_up_after_itself() {
        let fx = Fixture::new();
        let missing =
            ContentModification::add(misc(&["a", "b", "file.txt"]), Digest::of(b"never stored"));
        assert!(matches!(
            fx.applier().apply("p1", None, &missing),
            Err(PatchError::ContentNotFound { .. })
        ));
        assert!(!fx.root().join("a").exists());

        // the manifest is stored but one of its entries is not
        let manifest = content_store::ModuleManifest::from_entries(vec![(
            "module.xml".to_string(),
            Digest::of(b"<module/>"),
        )]);
        let module = fx.store.put(&manifest.encode().unwrap()).unwrap();
        let item = ContentItem::Module {
            name: "org.acme".into(),
            slot: "main".into(),
        };
        assert!(matches!(
            fx.applier().apply("p1", Some("base"), &ContentModification::add(item, module)),
            Err(PatchError::ContentNotFound { .. })
        ));
        assert!(!fx.root().join("modules").exists());
    }

    #[test]
    fn test_module_without_layer_is_rejected() {
        let fx = Fixture::new();
        let item = ContentItem::Module {
            name: "a.b".into(),
            slot: "main".into(),
        };
        let m = ContentModification::add(item, Digest::of(b"x"));
        assert!(matches!(
            fx.applier().apply("p1", None, &m),
            Err(PatchError::InvalidPatch { .. })
        ));
    }
}
