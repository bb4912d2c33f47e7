//! Content-addressable blob store backing patch contents and backups.
//!
//! Blobs are keyed by the BLAKE3 digest of their uncompressed bytes and kept
//! zstd-compressed on disk:
//!
//! ```text
//! <content>/
//!   objects/<first 2 hex chars>/<full hex digest>
//!   tmp/     staging area, renamed into objects/ once complete
//! ```
//!
//! A module is stored as a manifest blob listing `(relative path, digest)`
//! for each of its resource entries; the module's digest is the digest of the
//! manifest, so equal module trees always hash equal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

use crate::digest::Digest;
use crate::error::{IoResultExt, PatchError, Result};
use crate::util;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const COMPRESSION_LEVEL: i32 = 3;

/// One resource file of a module, addressed relative to the module directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub path: String,
    pub digest: Digest,
}

/// Canonical description of a module's content set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub entries: Vec<ModuleEntry>,
}

impl ModuleManifest {
    /// Build from unordered entries; output is sorted by path.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Digest)>) -> Self {
        let sorted: BTreeMap<String, Digest> = entries.into_iter().collect();
        ModuleManifest {
            entries: sorted
                .into_iter()
                .map(|(path, digest)| ModuleEntry { path, digest })
                .collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PatchError::codec("encode module manifest", e))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PatchError::codec("decode module manifest", e))
    }

    /// Combined digest over all entries.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of(&self.encode()?))
    }
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    fsync: bool,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let root = root.into();
        for dir in [root.join(OBJECTS_DIR), root.join(TMP_DIR)] {
            fs::create_dir_all(&dir).at(&dir)?;
        }
        Ok(Self { root, fsync })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `data`, returning its digest. Storing the same bytes twice is a
    /// no-op that returns the same digest.
    #[instrument(skip(self, data), level = "debug", fields(len = data.len()))]
    pub fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let path = self.object_path(&digest);
        if path.exists() {
            debug!(digest = %digest.short(), "content hit");
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }

        let compressed = zstd::bulk::compress(data, COMPRESSION_LEVEL)
            .map_err(|e| PatchError::codec("compress content", e))?;

        // stage in tmp/ so readers of objects/ never observe partial blobs
        let staged = util::stage_path(&self.root.join(TMP_DIR).join(digest.to_hex()));
        let write = (|| -> Result<()> {
            let mut file = fs::File::create(&staged).at(&staged)?;
            std::io::Write::write_all(&mut file, &compressed).at(&staged)?;
            if self.fsync {
                file.sync_all().at(&staged)?;
            }
            Ok(())
        })();
        if let Err(e) = write {
            remove_staged(&staged);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staged, &path) {
            remove_staged(&staged);
            // another writer may have won the race with identical bytes
            if !path.exists() {
                return Err(PatchError::io(path, e));
            }
        }
        debug!(digest = %digest.short(), "content stored");
        Ok(digest)
    }

    /// Fetch the bytes for `digest`, verifying them on the way out.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        let compressed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PatchError::ContentNotFound { digest: *digest })
            }
            Err(e) => return Err(PatchError::io(path, e)),
        };
        let data = zstd::stream::decode_all(compressed.as_slice())
            .map_err(|e| PatchError::codec("decompress content", e))?;
        let actual = Digest::of(&data);
        if actual != *digest {
            return Err(PatchError::CorruptContent {
                expected: *digest,
                actual,
            });
        }
        Ok(data)
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// Store a module's resource entries plus its manifest; returns the
    /// module digest.
    pub fn put_module<P, B>(&self, entries: &[(P, B)]) -> Result<Digest>
    where
        P: AsRef<str>,
        B: AsRef<[u8]>,
    {
        let mut listed = Vec::with_capacity(entries.len());
        for (path, bytes) in entries {
            listed.push((path.as_ref().to_string(), self.put(bytes.as_ref())?));
        }
        let manifest = ModuleManifest::from_entries(listed);
        self.put(&manifest.encode()?)
    }

    pub fn module_manifest(&self, digest: &Digest) -> Result<ModuleManifest> {
        ModuleManifest::decode(&self.get(digest)?)
    }

    /// Snapshot an on-disk module directory into the store, returning its digest.
    pub fn put_module_dir(&self, dir: &Path) -> Result<Digest> {
        let mut listed = Vec::new();
        for entry in util::walk_files(dir)? {
            let bytes = fs::read(&entry.full_path).at(&entry.full_path)?;
            listed.push((entry.relative_path, self.put(&bytes)?));
        }
        let manifest = ModuleManifest::from_entries(listed);
        self.put(&manifest.encode()?)
    }

    /// Remove staging leftovers from interrupted writes. Returns how many
    /// files were removed.
    pub fn sweep_partials(&self) -> Result<usize> {
        let tmp = self.root.join(TMP_DIR);
        let mut removed = 0;
        for entry in fs::read_dir(&tmp).at(&tmp)? {
            let entry = entry.at(&tmp)?;
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to sweep partial"),
            }
        }
        if removed > 0 {
            debug!(removed, "swept content staging leftovers");
        }
        Ok(removed)
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(hex)
    }
}

fn remove_staged(staged: &Path) {
    if let Err(e) = fs::remove_file(staged) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %staged.display(), error = %e, "failed to remove staged blob");
        }
    }
}

/// Digest of a module directory as it currently sits on disk, without
/// storing anything.
pub fn module_dir_digest(dir: &Path) -> Result<Digest> {
    let mut listed = Vec::new();
    for entry in util::walk_files(dir)? {
        listed.push((entry.relative_path, util::hash_file(&entry.full_path, entry.size)?));
    }
    ModuleManifest::from_entries(listed).digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path(), false).unwrap();

        let digest = store.put(b"Hello World!").unwrap();
        assert_eq!(digest, Digest::of(b"Hello World!"));
        assert!(store.has(&digest));
        assert_eq!(store.get(&digest).unwrap(), b"Hello World!");
    }

    #[test]
    fn test_deduplication() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path(), false).unwrap();

        let d1 = store.put(b"same").unwrap();
        let d2 = store.put(b"same").unwrap();
        assert_eq!(d1, d2);

        let shard = temp.path().join(OBJECTS_DIR).join(&d1.to_hex()[..2]);
        assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn test_not_found() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path(), false).unwrap();
        let missing = Digest::of(b"never stored");
        assert!(!store.has(&missing));
        assert!(matches!(
            store.get(&missing),
            Err(PatchError::ContentNotFound { .. })
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path(), false).unwrap();
        let digest = store.put(b"original").unwrap();

        let tampered = zstd::bulk::compress(b"tampered", 3).unwrap();
        fs::write(store.object_path(&digest), tampered).unwrap();
        assert!(matches!(
            store.get(&digest),
            Err(PatchError::CorruptContent { .. })
        ));
    }

    #[test]
    fn test_empty_blob() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path(), false).unwrap();
        let digest = store.put(b"").unwrap();
        assert!(store.get(&digest).unwrap().is_empty());
    }

    #[test]
    fn test_module_digest_matches_directory() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path().join("store"), false).unwrap();

        // entry order must not matter
        let digest = store
            .put_module(&[("testFile2", b"content2"), ("testFile1", b"content1")])
            .unwrap();

        let dir = temp.path().join("module");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("testFile1"), b"content1").unwrap();
        fs::write(dir.join("testFile2"), b"content2").unwrap();

        assert_eq!(module_dir_digest(&dir).unwrap(), digest);
        assert_eq!(store.put_module_dir(&dir).unwrap(), digest);

        let manifest = store.module_manifest(&digest).unwrap();
        let paths: Vec<_> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["testFile1", "testFile2"]);
    }

    #[test]
    fn test_sweep_partials() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path(), false).unwrap();
        fs::write(temp.path().join(TMP_DIR).join("leftover"), b"x").unwrap();
        assert_eq!(store.sweep_partials().unwrap(), 1);
        assert_eq!(store.sweep_partials().unwrap(), 0);
    }
}
