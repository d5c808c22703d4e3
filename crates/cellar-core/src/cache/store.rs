//! Persistent, content-addressed store of executed notebooks.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use uuid::Uuid;

use super::artifacts::copy_relative;
use super::record::{
    ArtifactRecord, CacheEntry, CacheRecord, RECORD_VERSION, checked_relative, to_record_path,
    unix_now,
};
use crate::error::CacheError;
use crate::fingerprint::FingerprintKey;
use crate::notebook::Notebook;

const VERSION_FILE: &str = "VERSION";
const ENTRIES_DIR: &str = "entries";
const RECORD_FILE: &str = "record.bin";
const ARTIFACTS_DIR: &str = "artifacts";
const LOCK_EXTENSION: &str = "lock";

/// What a successful execution hands to [`CacheStore::put`].
#[derive(Debug, Clone, Copy)]
pub struct PendingEntry<'a> {
    /// The executed notebook.
    pub notebook: &'a Notebook,
    /// Wall-clock execution time.
    pub runtime: Option<Duration>,
    /// Directory the artifact paths are relative to.
    pub artifact_root: &'a Path,
    /// Files produced by the execution.
    pub artifacts: &'a [PathBuf],
}

/// On-disk cache store.
///
/// Each key owns a directory under `entries/` plus a sibling lock file.
/// Writers stage a complete entry and swap it in under an exclusive lock;
/// readers hold a shared lock, so a reader never observes half an entry.
/// Different keys never contend.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(root.join(ENTRIES_DIR))?;

        let version_path = root.join(VERSION_FILE);
        let current = RECORD_VERSION.to_string();
        match fs::read_to_string(&version_path) {
            Ok(found) if found.trim() == current => {}
            Ok(found) => {
                tracing::info!(
                    "Cache at {} has version {}, current is {}; existing entries will be re-executed",
                    root.display(),
                    found.trim(),
                    current
                );
                fs::write(&version_path, format!("{}\n", current))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(&version_path, format!("{}\n", current))?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up `key`. Unreadable entries are misses.
    pub fn get(&self, key: &FingerprintKey) -> Option<CacheEntry> {
        match self.load(key) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::info!("Ignoring unreadable cache entry {}: {}", key, e);
                None
            }
        }
    }

    /// Look up `key`, reporting why an existing entry could not be read.
    pub fn load(&self, key: &FingerprintKey) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.entry_dir(key);
        if !dir.is_dir() {
            return Ok(None);
        }

        let _lock = KeyLock::shared(&self.lock_path(key), key)?;

        let record = match CacheRecord::read(&dir.join(RECORD_FILE)) {
            Ok(record) => record,
            Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let artifact_dir = dir.join(ARTIFACTS_DIR);
        for artifact in &record.artifacts {
            verify_artifact(&artifact_dir, artifact)?;
        }

        CacheEntry::from_record(*key, record).map(Some)
    }

    /// Store `pending` under `key`, replacing any existing entry.
    pub fn put(&self, key: &FingerprintKey, pending: PendingEntry<'_>) -> Result<(), CacheError> {
        let _lock = KeyLock::exclusive(&self.lock_path(key), key)?;

        let staging = self
            .entries_dir()
            .join(format!(".staging-{}", Uuid::new_v4()));
        let result = stage(&staging, key, &pending).and_then(|()| self.publish(&staging, key));
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result?;

        tracing::debug!(
            "Cached {} ({} artifacts)",
            key,
            pending.artifacts.len()
        );
        Ok(())
    }

    /// Check whether an entry exists for `key`, without validating it.
    pub fn contains(&self, key: &FingerprintKey) -> bool {
        self.entry_dir(key).join(RECORD_FILE).is_file()
    }

    /// Absolute paths of `entry`'s artifacts inside the store.
    pub fn list_artifacts(&self, entry: &CacheEntry) -> Vec<PathBuf> {
        let base = self.entry_dir(&entry.key).join(ARTIFACTS_DIR);
        entry.artifacts.iter().map(|p| base.join(p)).collect()
    }

    /// Copy `entry`'s artifacts into `dest`, preserving their relative paths.
    ///
    /// Returns the destination paths.
    pub fn copy_artifacts(&self, entry: &CacheEntry, dest: &Path) -> Result<Vec<PathBuf>, CacheError> {
        if entry.artifacts.is_empty() {
            return Ok(Vec::new());
        }

        let _lock = KeyLock::shared(&self.lock_path(&entry.key), &entry.key)?;
        let base = self.entry_dir(&entry.key).join(ARTIFACTS_DIR);

        let mut copied = Vec::with_capacity(entry.artifacts.len());
        for relative in &entry.artifacts {
            copy_relative(&base, dest, relative)?;
            copied.push(dest.join(relative));
        }
        Ok(copied)
    }

    /// All readable entries, oldest first.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries: Vec<CacheEntry> = self
            .keys()?
            .iter()
            .filter_map(|key| self.get(key))
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Remove every entry. Returns the number of entries removed.
    ///
    /// Housekeeping only; do not run while builds are using the store.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;

        for key in self.keys()? {
            let lock_path = self.lock_path(&key);
            {
                let _lock = KeyLock::exclusive(&lock_path, &key)?;
                fs::remove_dir_all(self.entry_dir(&key))?;
            }
            let _ = fs::remove_file(&lock_path);
            removed += 1;
        }

        // Leftovers from interrupted writers.
        for entry in fs::read_dir(self.entries_dir())? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if hidden && path.is_dir() {
                fs::remove_dir_all(&path)?;
            }
        }

        tracing::debug!("Cleared {} cache entries from {}", removed, self.root.display());
        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<FingerprintKey>, CacheError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(self.entries_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<FingerprintKey>().ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn publish(&self, staging: &Path, key: &FingerprintKey) -> Result<(), CacheError> {
        let target = self.entry_dir(key);
        if !target.exists() {
            fs::rename(staging, &target)?;
            return Ok(());
        }

        let trash = self.entries_dir().join(format!(".trash-{}", Uuid::new_v4()));
        fs::rename(&target, &trash)?;
        fs::rename(staging, &target)?;
        if let Err(e) = fs::remove_dir_all(&trash) {
            tracing::warn!("Failed to remove replaced cache entry {}: {}", trash.display(), e);
        }
        Ok(())
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIR)
    }

    fn entry_dir(&self, key: &FingerprintKey) -> PathBuf {
        self.entries_dir().join(key.to_hex())
    }

    fn lock_path(&self, key: &FingerprintKey) -> PathBuf {
        self.entries_dir()
            .join(format!("{}.{}", key.to_hex(), LOCK_EXTENSION))
    }
}

fn stage(staging: &Path, key: &FingerprintKey, pending: &PendingEntry<'_>) -> Result<(), CacheError> {
    fs::create_dir_all(staging)?;

    let artifact_dir = staging.join(ARTIFACTS_DIR);
    let mut artifacts = Vec::with_capacity(pending.artifacts.len());
    for relative in pending.artifacts {
        let path = to_record_path(relative)?;
        let size = copy_relative(pending.artifact_root, &artifact_dir, relative)?;
        artifacts.push(ArtifactRecord { path, size });
    }

    let notebook_json = serde_json::to_string(pending.notebook)
        .map_err(|e| CacheError::Serialize(e.to_string()))?;

    let record = CacheRecord {
        version: RECORD_VERSION,
        key: key.to_hex(),
        created_at: unix_now(),
        runtime_ms: pending
            .runtime
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        notebook_json,
        artifacts,
    };
    record.write(&staging.join(RECORD_FILE))
}

fn verify_artifact(artifact_dir: &Path, artifact: &ArtifactRecord) -> Result<(), CacheError> {
    let path = artifact_dir.join(checked_relative(&artifact.path)?);
    let size = fs::metadata(&path)
        .map_err(|e| CacheError::Corrupt(format!("artifact {}: {}", artifact.path, e)))?
        .len();
    if size != artifact.size {
        return Err(CacheError::Corrupt(format!(
            "artifact {} is {} bytes, recorded {}",
            artifact.path, size, artifact.size
        )));
    }
    Ok(())
}

/// Advisory lock on one key's lock file, released on drop.
#[derive(Debug)]
struct KeyLock {
    file: File,
}

impl KeyLock {
    fn shared(path: &Path, key: &FingerprintKey) -> Result<Self, CacheError> {
        Self::acquire(path, key, false)
    }

    fn exclusive(path: &Path, key: &FingerprintKey) -> Result<Self, CacheError> {
        Self::acquire(path, key, true)
    }

    fn acquire(path: &Path, key: &FingerprintKey, exclusive: bool) -> Result<Self, CacheError> {
        let lock_error = |source| CacheError::Lock {
            key: key.to_hex(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(lock_error)?;

        if exclusive {
            FileExt::lock_exclusive(&file).map_err(lock_error)?;
        } else {
            FileExt::lock_shared(&file).map_err(lock_error)?;
        }

        Ok(Self { file })
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
