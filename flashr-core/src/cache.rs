//! The on-disk image cache.
//!
//! A flat directory of completed artifacts (downloads and their decompressed
//! outputs), bounded by a size cap and evicted least-recently-used first.
//! Last access is recorded in each file's mtime. Files still being produced,
//! and downloads set aside after a checksum mismatch, carry a suffix and are
//! not entries.
//!
//! Derived artifacts are keyed by their source, not just by name: see
//! [`source_key`].

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use filetime::FileTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

pub const DOWNLOADING_SUFFIX: &str = ".downloading";
pub const PARTIAL_SUFFIX: &str = ".partial";
pub const UNVERIFIED_SUFFIX: &str = ".unverified";

const IN_PROGRESS_SUFFIXES: &[&str] = &[DOWNLOADING_SUFFIX, PARTIAL_SUFFIX, UNVERIFIED_SUFFIX];
const SOURCE_DIGEST_LEN: usize = 12;

/// A cache key of the form `<digest>-<name>`, where the digest is taken
/// over `source` (a URL, or a fingerprint of an input file).
///
/// Two artifacts with the same file name but different sources never share
/// a key.
pub fn source_key(source: &[u8], name: &str) -> String {
    let digest = hex::encode(Sha256::digest(source));
    format!("{}-{}", &digest[..SOURCE_DIGEST_LEN], name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub last_access: SystemTime,
    pub created: SystemTime,
}

pub struct CacheManager {
    dir: PathBuf,
    enabled: bool,
    max_size: u64,
    lock: Mutex<()>,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool, max_size: u64) -> Self {
        Self {
            dir: dir.into(),
            enabled,
            max_size,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.dir, config.enabled, config.max_size)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Cache("cache lock poisoned".to_string()))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Cache(format!(
                "failed to create cache directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// The final path for `key`, creating the cache directory if needed.
    ///
    /// Nothing is written; producers create their in-progress file next to
    /// the returned path and rename it into place when done.
    pub fn reserve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let _guard = self.guard()?;
        self.ensure_dir()?;
        Ok(self.dir.join(key))
    }

    /// Returns the completed entry for `key` and marks it as used.
    ///
    /// Always misses when caching is disabled.
    pub fn lookup(&self, key: &str) -> Option<PathBuf> {
        if !self.enabled || validate_key(key).is_err() {
            return None;
        }
        let _guard = self.guard().ok()?;
        let path = self.dir.join(key);
        if !path.is_file() {
            debug!("Image not in cache: {}", key);
            return None;
        }
        if let Err(e) = touch_path(&path) {
            warn!("Failed to update access time of {}: {}", path.display(), e);
        }
        info!("Found cached image: {}", path.display());
        Some(path)
    }

    /// Marks `key` as completed and, when caching is enabled, evicts older
    /// entries until the cache fits its cap. The new entry is never evicted
    /// by this call, even if it alone exceeds the cap.
    pub fn record_completed(&self, key: &str, size: u64) -> Result<Vec<PathBuf>> {
        validate_key(key)?;
        let _guard = self.guard()?;
        let path = self.dir.join(key);
        touch_path(&path)
            .map_err(|e| Error::Cache(format!("failed to record {}: {}", path.display(), e)))?;
        debug!("Recorded cache entry {} ({} bytes)", key, size);

        if !self.enabled {
            return Ok(Vec::new());
        }
        self.evict_locked(self.max_size, Some(&path))
    }

    pub fn touch(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let _guard = self.guard()?;
        let path = self.dir.join(key);
        touch_path(&path)
            .map_err(|e| Error::Cache(format!("failed to touch {}: {}", path.display(), e)))
    }

    /// Completed entries, least recently used first.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let _guard = self.guard()?;
        self.entries_locked()
    }

    pub fn current_size(&self) -> Result<u64> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    /// Removes least recently used entries until the total is at most
    /// `max_bytes`. Returns the removed paths.
    pub fn evict_to_fit(&self, max_bytes: u64) -> Result<Vec<PathBuf>> {
        let _guard = self.guard()?;
        self.evict_locked(max_bytes, None)
    }

    /// Removes every file in the cache directory, in-progress files included.
    pub fn clear_all(&self) -> Result<usize> {
        let _guard = self.guard()?;
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut failed = 0;
        for path in self.files_locked()? {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed {}", path.display());
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    failed += 1;
                }
            }
        }
        info!("Cache cleared: {} files removed, {} failed", removed, failed);

        if failed > 0 {
            return Err(Error::Cache(format!("failed to remove {} cached files", failed)));
        }
        Ok(removed)
    }

    /// Normal deletion of an artifact after use.
    ///
    /// When caching is enabled the entry is kept for reuse and `Ok(false)` is
    /// returned. Paths outside the cache directory are refused.
    pub fn delete(&self, path: &Path) -> Result<bool> {
        self.check_inside(path)?;
        if self.enabled {
            debug!("Keeping {} for reuse", path.display());
            return Ok(false);
        }
        self.remove(path)
    }

    /// Deletes an artifact regardless of the caching setting. Used when the
    /// artifact is suspected to be corrupt.
    pub fn force_delete(&self, path: &Path) -> Result<bool> {
        self.check_inside(path)?;
        warn!("Force-deleting cached image {}", path.display());
        self.remove(path)
    }

    /// Whether `path` names a file directly inside the cache directory.
    pub fn contains_path(&self, path: &Path) -> bool {
        let Ok(dir) = fs::canonicalize(&self.dir) else {
            return false;
        };
        let candidate = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(_) => match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) => match fs::canonicalize(parent) {
                    Ok(p) => p.join(name),
                    Err(_) => return false,
                },
                _ => return false,
            },
        };
        candidate.parent() == Some(dir.as_path())
    }

    /// Startup maintenance: drops leftovers from interrupted sessions, then
    /// clears the cache when caching is disabled or evicts it to the cap.
    pub fn housekeeping(&self) -> Result<()> {
        if !self.enabled {
            if self.dir.exists() {
                info!("Caching is disabled, clearing {}", self.dir.display());
                self.clear_all()?;
            }
            return Ok(());
        }

        {
            let _guard = self.guard()?;
            if self.dir.exists() {
                for path in self.files_locked()? {
                    if is_in_progress(&path) {
                        info!("Removing stale partial file {}", path.display());
                        if let Err(e) = fs::remove_file(&path) {
                            warn!("Failed to remove {}: {}", path.display(), e);
                        }
                    }
                }
            }
        }
        self.evict_to_fit(self.max_size)?;
        Ok(())
    }

    fn check_inside(&self, path: &Path) -> Result<()> {
        if self.contains_path(path) {
            Ok(())
        } else {
            Err(Error::Cache(format!(
                "refusing to delete {}: not inside the cache directory",
                path.display()
            )))
        }
    }

    fn remove(&self, path: &Path) -> Result<bool> {
        let _guard = self.guard()?;
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Deleted {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Cache(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn files_locked(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::Cache(format!("failed to read {}: {}", self.dir.display(), e))
        })?;
        Ok(entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect())
    }

    fn entries_locked(&self) -> Result<Vec<CacheEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for path in self.files_locked()? {
            if is_in_progress(&path) {
                continue;
            }
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let last_access = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(CacheEntry {
                created: metadata.created().unwrap_or(last_access),
                path,
                size: metadata.len(),
                last_access,
            });
        }
        lru_order(&mut entries);
        Ok(entries)
    }

    fn evict_locked(&self, max_bytes: u64, pinned: Option<&Path>) -> Result<Vec<PathBuf>> {
        let entries = self.entries_locked()?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= max_bytes {
            debug!("Cache size {} is within limit {}", total, max_bytes);
            return Ok(Vec::new());
        }

        info!("Cache size {} exceeds limit {}, evicting", total, max_bytes);
        let mut evicted = Vec::new();
        for entry in entries {
            if total <= max_bytes {
                break;
            }
            if pinned == Some(entry.path.as_path()) {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    info!("Evicted {}", entry.path.display());
                    total = total.saturating_sub(entry.size);
                    evicted.push(entry.path);
                }
                Err(e) => warn!("Failed to evict {}: {}", entry.path.display(), e),
            }
        }
        Ok(evicted)
    }
}

/// Sorts entries least recently used first. Ties go to the oldest creation
/// time, then to the name.
pub fn lru_order(entries: &mut [CacheEntry]) {
    entries.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then(a.created.cmp(&b.created))
            .then_with(|| a.path.cmp(&b.path))
    });
}

fn touch_path(path: &Path) -> std::io::Result<()> {
    filetime::set_file_mtime(path, FileTime::now())
}

fn is_in_progress(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    IN_PROGRESS_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Keys are plain file names.
fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\'])
        || IN_PROGRESS_SUFFIXES.iter().any(|s| key.ends_with(s));
    if invalid {
        return Err(Error::Cache(format!("invalid cache key {:?}", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache(enabled: bool, max_size: u64) -> (TempDir, CacheManager) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().join("images"), enabled, max_size);
        (dir, cache)
    }

    fn put(cache: &CacheManager, key: &str, size: usize, accessed_secs: i64) -> PathBuf {
        let path = cache.reserve(key).unwrap();
        fs::write(&path, vec![0u8; size]).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(accessed_secs, 0)).unwrap();
        path
    }

    #[test]
    fn lru_order_breaks_ties_by_creation_then_name() {
        let t = |s| SystemTime::UNIX_EPOCH + Duration::from_secs(s);
        let entry = |name: &str, access, created| CacheEntry {
            path: PathBuf::from(name),
            size: 1,
            last_access: t(access),
            created: t(created),
        };
        let mut entries = vec![
            entry("c", 20, 1),
            entry("b", 10, 5),
            entry("a", 10, 5),
            entry("d", 10, 2),
        ];
        lru_order(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.path.to_str().unwrap()).collect();
        assert_eq!(names, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let (_tmp, cache) = cache(true, 10_000);
        let old = put(&cache, "old.img.xz", 400, 1_000);
        let mid = put(&cache, "mid.img.xz", 400, 2_000);
        let new = put(&cache, "new.img.xz", 400, 3_000);

        let evicted = cache.evict_to_fit(800).unwrap();
        assert_eq!(evicted, vec![old.clone()]);
        assert!(!old.exists());
        assert!(mid.exists() && new.exists());
        assert_eq!(cache.current_size().unwrap(), 800);
    }

    #[test]
    fn lookup_touches_entry_so_it_survives_eviction() {
        let (_tmp, cache) = cache(true, 10_000);
        let first = put(&cache, "first.img", 100, 1_000);
        let second = put(&cache, "second.img", 100, 2_000);

        assert_eq!(cache.lookup("first.img"), Some(first.clone()));
        cache.evict_to_fit(100).unwrap();
        assert!(first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn record_completed_pins_new_entry() {
        let (_tmp, cache) = cache(true, 500);
        put(&cache, "a.img", 300, 1_000);
        let big = put(&cache, "big.img", 600, 1);

        let evicted = cache.record_completed("big.img", 600).unwrap();
        assert_eq!(evicted.len(), 1);
        assert!(big.exists(), "freshly completed entry must not be evicted");
    }

    #[test]
    fn in_progress_files_are_not_entries_but_clear_removes_them() {
        let (_tmp, cache) = cache(true, 10_000);
        put(&cache, "done.img", 10, 1_000);
        fs::write(cache.dir().join("next.img.xz.downloading"), b"abc").unwrap();
        fs::write(cache.dir().join("out.img.partial"), b"abc").unwrap();

        assert_eq!(cache.entries().unwrap().len(), 1);
        assert!(cache.evict_to_fit(0).unwrap().len() == 1);
        assert_eq!(fs::read_dir(cache.dir()).unwrap().count(), 2);

        assert_eq!(cache.clear_all().unwrap(), 2);
        assert_eq!(fs::read_dir(cache.dir()).unwrap().count(), 0);
    }

    #[test]
    fn unverified_downloads_are_not_entries() {
        let (_tmp, cache) = cache(true, 100);
        put(&cache, "done.img", 10, 1_000);
        fs::write(cache.dir().join("a1b2c3-board.img.unverified"), vec![0u8; 500]).unwrap();

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(cache.current_size().unwrap(), 10);
        assert!(cache.evict_to_fit(100).unwrap().is_empty());
    }

    #[test]
    fn source_keys_separate_same_named_sources() {
        let a = source_key(b"https://dl.example.org/a/board.img", "board.img");
        let b = source_key(b"https://dl.example.org/b/board.img", "board.img");
        assert_ne!(a, b);
        assert!(a.ends_with("-board.img"));
        assert_eq!(a.len(), SOURCE_DIGEST_LEN + 1 + "board.img".len());
        assert_eq!(a, source_key(b"https://dl.example.org/a/board.img", "board.img"));
        assert!(validate_key(&a).is_ok());
    }

    #[test]
    fn delete_keeps_entries_while_caching_is_enabled() {
        let (_tmp, cache) = cache(true, 10_000);
        let path = put(&cache, "keep.img", 10, 1_000);
        assert!(!cache.delete(&path).unwrap());
        assert!(path.exists());
        assert!(cache.force_delete(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn delete_removes_when_caching_is_disabled() {
        let (_tmp, cache) = cache(false, 10_000);
        let path = put(&cache, "gone.img", 10, 1_000);
        assert_eq!(cache.lookup("gone.img"), None);
        assert!(cache.delete(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn refuses_paths_outside_the_cache() {
        let (tmp, cache) = cache(false, 10_000);
        cache.reserve("x.img").unwrap();
        let outside = tmp.path().join("victim.img");
        fs::write(&outside, b"data").unwrap();

        assert!(matches!(cache.delete(&outside), Err(Error::Cache(_))));
        assert!(matches!(cache.force_delete(&outside), Err(Error::Cache(_))));
        let sneaky = cache.dir().join("..").join("victim.img");
        assert!(cache.force_delete(&sneaky).is_err());
        assert!(outside.exists());
    }

    #[test]
    fn rejects_keys_that_escape_the_directory() {
        let (_tmp, cache) = cache(true, 10_000);
        assert!(cache.reserve("../etc/passwd").is_err());
        assert!(cache.reserve("").is_err());
        assert!(cache.reserve("a.img.partial").is_err());
    }

    #[test]
    fn housekeeping_drops_stale_partials_and_evicts() {
        let (_tmp, cache) = cache(true, 100);
        put(&cache, "old.img", 80, 1_000);
        put(&cache, "new.img", 80, 2_000);
        fs::write(cache.dir().join("crashed.img.xz.downloading"), b"x").unwrap();
        fs::write(cache.dir().join("rejected.img.xz.unverified"), vec![0u8; 500]).unwrap();

        cache.housekeeping().unwrap();
        let names: Vec<_> = fs::read_dir(cache.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["new.img"]);
    }

    #[test]
    fn housekeeping_clears_disabled_cache() {
        let (_tmp, cache) = cache(false, 100);
        put(&cache, "old.img", 10, 1_000);
        cache.housekeeping().unwrap();
        assert_eq!(cache.current_size().unwrap(), 0);
    }
}
