use memmap2::Mmap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::digest::Digest;
use crate::error::{IoResultExt, PatchError, Result};

/// Files at or above this size are hashed through a memory map.
const MMAP_THRESHOLD: u64 = 256 * 1024;

/// Infix of every staging name produced by [`stage_path`].
const STAGE_MARKER: &str = ".dp-stage-";

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Forward-slash path relative to the walked root.
    pub relative_path: String,
    pub full_path: PathBuf,
    pub size: u64,
}

/// Walk a directory tree and collect every regular file with its relative path.
/// Paths use forward slashes so digests do not depend on the host platform.
pub fn walk_files(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            PatchError::io(path, e.into())
        })?;
        if entry.file_type().is_dir() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(root)
            .map_err(|e| PatchError::codec("compute relative path", e))?;
        let relative_path = relative
            .to_str()
            .ok_or_else(|| PatchError::codec("read path", format!("non-UTF8 path {}", relative.display())))?
            .replace('\\', "/");

        let size = entry.metadata().map_err(|e| PatchError::io(&full_path, e.into()))?.len();

        entries.push(FileEntry {
            relative_path,
            full_path,
            size,
        });
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = fs::File::open(path).at(path)?;
    // SAFETY: We only read from this mapping; the tree is quiesced while patching.
    unsafe { Mmap::map(&file).at(path) }
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> Result<Digest> {
    let file = fs::File::open(path).at(path)?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher).at(path)?;
    Ok(hasher.finalize().into())
}

/// Hash a file, picking mmap for large files.
pub fn hash_file(path: &Path, size: u64) -> Result<Digest> {
    if size >= MMAP_THRESHOLD {
        let map = mmap_file(path)?;
        Ok(Digest::of(&map))
    } else {
        hash_file_streaming(path)
    }
}

/// Read a whole file, through a memory map when it is large.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let size = fs::metadata(path).at(path)?.len();
    if size >= MMAP_THRESHOLD {
        Ok(mmap_file(path)?.to_vec())
    } else {
        fs::read(path).at(path)
    }
}

/// Sibling path used to stage content before it is renamed over `target`.
/// Unique per process and call so concurrent writers never collide.
pub fn stage_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{name}{STAGE_MARKER}{}-{seq}", std::process::id()))
}

fn is_stage_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(STAGE_MARKER)
}

/// Delete staging files and retired directories an aborted operation left
/// anywhere below `root`. `skip` (the metadata directory) is not entered.
pub fn sweep_stage_leftovers(root: &Path, skip: &Path) -> Result<usize> {
    let mut leftovers = Vec::new();
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.path() != skip);
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            PatchError::io(path, e.into())
        })?;
        if !is_stage_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        if is_dir {
            walker.skip_current_dir();
        }
        leftovers.push((entry.into_path(), is_dir));
    }

    for (path, is_dir) in &leftovers {
        if *is_dir {
            fs::remove_dir_all(path).at(path)?;
        } else {
            fs::remove_file(path).at(path)?;
        }
        debug!(path = %path.display(), "removed staging leftover");
    }
    Ok(leftovers.len())
}

/// Write `data` next to `target` and rename it into place.
/// A crash leaves either the old file or the new one, never a torn write.
pub fn write_atomic(target: &Path, data: &[u8], fsync: bool) -> Result<()> {
    let staged = stage_path(target);
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&staged).at(&staged)?;
        file.write_all(data).at(&staged)?;
        if fsync {
            file.sync_all().at(&staged)?;
        }
        drop(file);
        fs::rename(&staged, target).at(target)
    })();
    if result.is_err() && staged.exists() {
        if let Err(e) = fs::remove_file(&staged) {
            warn!(path = %staged.display(), error = %e, "failed to remove staged file");
        }
    }
    result
}

/// Swap a fully materialised `staged` directory into `target`.
///
/// The previous directory (if any) is first renamed aside, so at every
/// instant `target` is either the complete old tree or the complete new one.
pub fn swap_dir(staged: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        let retired = stage_path(target);
        fs::rename(target, &retired).at(target)?;
        if let Err(e) = fs::rename(staged, target).at(target) {
            if let Err(restore) = fs::rename(&retired, target) {
                warn!(
                    path = %target.display(),
                    error = %restore,
                    "failed to move retired directory back"
                );
            }
            return Err(e);
        }
        fs::remove_dir_all(&retired).at(&retired)
    } else {
        fs::rename(staged, target).at(target)
    }
}

/// Remove a directory by renaming it aside first, so a crash never leaves
/// a half-deleted module in place.
pub fn remove_dir_atomic(target: &Path) -> Result<()> {
    let retired = stage_path(target);
    fs::rename(target, &retired).at(target)?;
    fs::remove_dir_all(&retired).at(&retired)
}

/// Ancestors of `path` below `root` that do not exist yet, relative to
/// `root` and outermost first.
pub fn missing_parents(root: &Path, path: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut cur = path.parent();
    while let Some(dir) = cur {
        if dir == root || dir.exists() || !dir.starts_with(root) {
            break;
        }
        if let Ok(rel) = dir.strip_prefix(root) {
            missing.push(rel.to_path_buf());
        }
        cur = dir.parent();
    }
    missing.reverse();
    missing
}

/// Create the missing ancestors of `path` below `root`, returning the ones
/// that were created (outermost first) so they can be removed on inversion.
pub fn create_parents(root: &Path, path: &Path) -> Result<Vec<PathBuf>> {
    let missing = missing_parents(root, path);
    for rel in &missing {
        let dir = root.join(rel);
        fs::create_dir(&dir).at(&dir)?;
    }
    Ok(missing)
}

/// Remove previously created directories (deepest first) while they are empty.
pub fn remove_created_dirs(root: &Path, created: &[PathBuf]) -> Result<()> {
    for rel in created.iter().rev() {
        let dir = root.join(rel);
        match fs::read_dir(&dir) {
            Ok(mut it) => {
                if it.next().is_none() {
                    fs::remove_dir(&dir).at(&dir)?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PatchError::io(dir, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.txt");
        write_atomic(&target, b"one", true).unwrap();
        write_atomic(&target, b"two", false).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
        // no staging leftovers
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let temp = TempDir::new().unwrap();
        let small = temp.path().join("small");
        let large = temp.path().join("large");
        fs::write(&small, b"Hello World!").unwrap();
        let big = vec![0x5Au8; (MMAP_THRESHOLD as usize) + 17];
        fs::write(&large, &big).unwrap();
        assert_eq!(hash_file(&small, 12).unwrap(), Digest::of(b"Hello World!"));
        assert_eq!(hash_file(&large, big.len() as u64).unwrap(), Digest::of(&big));
    }

    #[test]
    fn test_create_and_remove_parents() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("a")).unwrap();
        let target = root.join("a/b/c/file");
        let created = create_parents(root, &target).unwrap();
        assert_eq!(created, vec![PathBuf::from("a/b"), PathBuf::from("a/b/c")]);
        assert!(root.join("a/b/c").is_dir());

        remove_created_dirs(root, &created).unwrap();
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").is_dir());
    }

    #[test]
    fn test_sweep_stage_leftovers() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let metadata = root.join(".installation");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(&metadata).unwrap();
        fs::write(root.join("bin/a.conf"), b"A").unwrap();
        fs::write(stage_path(&root.join("bin/a.conf")), b"A1").unwrap();
        let retired = stage_path(&root.join("main"));
        fs::create_dir_all(retired.join("lib")).unwrap();
        fs::write(retired.join("lib/old.jar"), b"old").unwrap();
        let kept = stage_path(&metadata.join("lock"));
        fs::write(&kept, b"").unwrap();

        assert_eq!(sweep_stage_leftovers(root, &metadata).unwrap(), 2);
        assert_eq!(fs::read_dir(root.join("bin")).unwrap().count(), 1);
        assert!(!retired.exists());
        assert!(kept.exists());
        assert_eq!(sweep_stage_leftovers(root, &metadata).unwrap(), 0);
    }

    #[test]
    fn test_swap_dir() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("main");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("old.jar"), b"old").unwrap();

        let staged = stage_path(&target);
        fs::create_dir(&staged).unwrap();
        fs::write(staged.join("new.jar"), b"new").unwrap();

        swap_dir(&staged, &target).unwrap();
        assert!(!target.join("old.jar").exists());
        assert_eq!(fs::read(target.join("new.jar")).unwrap(), b"new");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_walk_files_is_sorted_and_relative() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("b.txt"), b"b").unwrap();
        fs::write(temp.path().join("sub/a.txt"), b"a").unwrap();
        let entries = walk_files(temp.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["b.txt", "sub/a.txt"]);
    }
}
