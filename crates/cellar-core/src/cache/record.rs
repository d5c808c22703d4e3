//! On-disk cache record, encoded with rkyv.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::error::CacheError;
use crate::fingerprint::FingerprintKey;
use crate::notebook::Notebook;

/// Current record format version.
///
/// Increment this when the record format changes in an incompatible way.
/// Records with a different version are treated as cache misses.
pub const RECORD_VERSION: u32 = 1;

/// Serialized form of a cache entry.
#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
pub struct CacheRecord {
    /// Record format version for compatibility checking.
    pub version: u32,

    /// Hex fingerprint key the record was stored under.
    pub key: String,

    /// Unix timestamp when the entry was written.
    pub created_at: u64,

    /// Wall-clock execution time in milliseconds.
    pub runtime_ms: Option<u64>,

    /// The executed notebook as nbformat JSON.
    pub notebook_json: String,

    /// Artifacts stored with the entry.
    pub artifacts: Vec<ArtifactRecord>,
}

/// An artifact file stored alongside a record.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Path relative to the execution directory, `/`-separated.
    pub path: String,

    /// File size in bytes, checked on read.
    pub size: u64,
}

impl CacheRecord {
    /// Encode and write the record to `path`.
    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map_err(|e| CacheError::Serialize(e.to_string()))?;

        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and validate a record from `path`.
    pub fn read(path: &Path) -> Result<Self, CacheError> {
        let bytes = fs::read(path)?;

        let archived = rkyv::access::<ArchivedCacheRecord, rancor::Error>(&bytes)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;

        let found_version: u32 = archived.version.into();
        if found_version != RECORD_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: RECORD_VERSION,
                found: found_version,
            });
        }

        rkyv::deserialize::<CacheRecord, rancor::Error>(archived)
            .map_err(|e| CacheError::Corrupt(e.to_string()))
    }
}

/// A cache entry as seen by callers.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Key the entry is stored under.
    pub key: FingerprintKey,

    /// When the entry was written.
    pub created_at: SystemTime,

    /// How long the original execution took.
    pub runtime: Option<Duration>,

    /// The executed notebook.
    pub notebook: Notebook,

    /// Artifact paths, relative to the execution directory.
    pub artifacts: Vec<PathBuf>,
}

impl CacheEntry {
    pub(crate) fn from_record(key: FingerprintKey, record: CacheRecord) -> Result<Self, CacheError> {
        if record.key != key.to_hex() {
            return Err(CacheError::Corrupt(format!(
                "record key {} stored under {}",
                record.key, key
            )));
        }
        let notebook: Notebook = serde_json::from_str(&record.notebook_json)
            .map_err(|e| CacheError::Corrupt(format!("notebook payload: {}", e)))?;
        let artifacts = record
            .artifacts
            .iter()
            .map(|a| checked_relative(&a.path))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            key,
            created_at: UNIX_EPOCH + Duration::from_secs(record.created_at),
            runtime: record.runtime_ms.map(Duration::from_millis),
            notebook,
            artifacts,
        })
    }
}

/// Convert a relative path to the `/`-separated form stored in records.
pub(crate) fn to_record_path(path: &Path) -> Result<String, CacheError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(CacheError::Corrupt(format!(
                    "artifact path must be relative without '..': {}",
                    path.display()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(CacheError::Corrupt("empty artifact path".to_string()));
    }
    Ok(parts.join("/"))
}

/// Parse a stored artifact path, rejecting anything escaping the entry.
pub(crate) fn checked_relative(stored: &str) -> Result<PathBuf, CacheError> {
    let path: PathBuf = stored.split('/').collect();
    to_record_path(&path)?;
    Ok(path)
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
