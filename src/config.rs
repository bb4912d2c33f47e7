use std::path::{Path, PathBuf};

pub const METADATA_DIR_NAME: &str = ".installation";

/// Where the engine finds the distribution tree and its bookkeeping.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the installed distribution.
    pub root: PathBuf,
    /// Holds history, patch records, the content store and the lock.
    pub metadata_dir: PathBuf,
    /// `sync_all` staged files before they are renamed into place.
    pub fsync: bool,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let metadata_dir = root.join(METADATA_DIR_NAME);
        Self {
            root,
            metadata_dir,
            fsync: true,
        }
    }

    pub fn with_metadata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metadata_dir = dir.into();
        self
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn content_dir(&self) -> PathBuf {
        self.metadata_dir.join("content")
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.metadata_dir.join("layers")
    }

    pub fn layer_file(&self, layer: &str) -> PathBuf {
        self.layers_dir().join(format!("{layer}.json"))
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.metadata_dir.join("patches")
    }

    pub fn patch_record_file(&self, patch_id: &str) -> PathBuf {
        self.patches_dir().join(format!("{patch_id}.json"))
    }

    pub fn installation_file(&self) -> PathBuf {
        self.metadata_dir.join("installation.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.metadata_dir.join("lock")
    }

    /// Present only while an apply or rollback is in flight.
    pub fn journal_file(&self) -> PathBuf {
        self.metadata_dir.join("journal.json")
    }

    /// Parent of every layer and add-on module root.
    pub fn modules_root(&self) -> PathBuf {
        self.root.join("modules").join("system")
    }

    /// Root directory of a layer's modules.
    pub fn layer_module_root(&self, layer: &str, add_on: bool) -> PathBuf {
        let kind = if add_on { "add-ons" } else { "layers" };
        self.modules_root().join(kind).join(layer)
    }

    /// True for paths a misc file must not occupy: the metadata directory,
    /// the module tree, anything inside them and any of their ancestors.
    pub fn is_reserved(&self, path: &Path) -> bool {
        let modules = self.modules_root();
        [self.metadata_dir.as_path(), modules.as_path()]
            .iter()
            .any(|reserved| path.starts_with(reserved) || reserved.starts_with(path))
    }

    /// Directory holding module `name` (dot separated) at `slot`.
    pub fn module_dir(&self, layer: &str, add_on: bool, name: &str, slot: &str) -> PathBuf {
        let mut dir = self.layer_module_root(layer, add_on);
        for part in name.split('.') {
            dir.push(part);
        }
        dir.push(slot);
        dir
    }

    pub fn misc_path(&self, segments: &[String]) -> PathBuf {
        join_segments(&self.root, segments)
    }
}

pub fn join_segments(base: &Path, segments: &[String]) -> PathBuf {
    let mut path = base.to_path_buf();
    for s in segments {
        path.push(s);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let cfg = EngineConfig::new("/opt/server");
        assert_eq!(cfg.metadata_dir, PathBuf::from("/opt/server/.installation"));
        assert_eq!(
            cfg.layer_file("base"),
            PathBuf::from("/opt/server/.installation/layers/base.json")
        );
        assert_eq!(
            cfg.module_dir("base", false, "org.wildfly.awesomemodule", "main"),
            PathBuf::from("/opt/server/modules/system/layers/base/org/wildfly/awesomemodule/main")
        );
        assert_eq!(
            cfg.module_dir("extras", true, "com.acme", "main"),
            PathBuf::from("/opt/server/modules/system/add-ons/extras/com/acme/main")
        );
        assert_eq!(
            cfg.misc_path(&["awesomeDirectory".into(), "awesomeFile".into()]),
            PathBuf::from("/opt/server/awesomeDirectory/awesomeFile")
        );
    }

    #[test]
    fn test_reserved_paths() {
        let cfg = EngineConfig::new("/opt/server");
        let misc = |parts: &[&str]| {
            let segments: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
            cfg.misc_path(&segments)
        };
        assert!(cfg.is_reserved(&misc(&[".installation", "patches", "ghost.json"])));
        assert!(cfg.is_reserved(&misc(&[".installation"])));
        assert!(cfg.is_reserved(&misc(&["modules", "system", "layers", "base", "x.txt"])));
        assert!(cfg.is_reserved(&misc(&["modules"])));
        assert!(!cfg.is_reserved(&misc(&["modules-extra", "x.txt"])));
        assert!(!cfg.is_reserved(&misc(&["modules", "README.txt"])));
        assert!(!cfg.is_reserved(&misc(&["bin", "standalone.conf"])));

        let external = EngineConfig::new("/opt/server").with_metadata_dir("/var/lib/server-patches");
        assert!(!external.is_reserved(&PathBuf::from("/opt/server/.installation/x")));
        assert!(external.is_reserved(&PathBuf::from("/var/lib/server-patches/lock")));
    }
}
