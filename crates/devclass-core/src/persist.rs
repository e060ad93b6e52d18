//! Digest-verified persistent map
//!
//! [`PersistentMap`] is an in-memory `HashMap` bound to a single backing file
//! for its whole lifetime. It tracks whether the in-memory entries may differ
//! from what was last written (the dirty flag), stores the whole map to the
//! file on request, and restores from it on construction.
//!
//! The on-disk form is a [`StoreRecord`]: the entries plus the time of the
//! store, encoded as MessagePack behind a short magic tag. Files are replaced
//! atomically (temp file in the same directory, then rename), so a failed
//! store never leaves a half-written backing file.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::hash::Hash;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::digest::{digest_bytes, digest_file, Digest, DigestAlgorithm};

/// Leading bytes of every backing file written by [`PersistentMap::store`]
const STORE_MAGIC: &[u8; 4] = b"DCPM";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Invalid backing file '{}': {reason}", .path.display())]
    InvalidBackingFile { path: PathBuf, reason: String },
    #[error("Backing file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("Corrupt store in '{}': {reason}", .path.display())]
    CorruptStore { path: PathBuf, reason: String },
    #[error("Failed to store to '{}': {reason}", .path.display())]
    StoreError { path: PathBuf, reason: String },
    #[error("Digest algorithm not available: {0}")]
    DigestUnavailable(String),
    #[error("Failed to restore '{}' while binding: {source}", .path.display())]
    RestoreFailed {
        path: PathBuf,
        #[source]
        source: Box<PersistError>,
    },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Persisted form of a [`PersistentMap`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord<K: Eq + Hash, V> {
    pub entries: HashMap<K, V>,
    pub last_store_time: Option<DateTime<Utc>>,
}

// Borrowing twin of StoreRecord so store() does not clone the entries.
// Field order must match StoreRecord.
#[derive(Serialize)]
struct StoreRecordRef<'a, K: Eq + Hash, V> {
    entries: &'a HashMap<K, V>,
    last_store_time: Option<DateTime<Utc>>,
}

/// A key/value map that saves itself to, and restores itself from, one file
#[derive(Debug)]
pub struct PersistentMap<K, V> {
    entries: HashMap<K, V>,
    backing_path: PathBuf,
    dirty: bool,
    last_store_time: Option<DateTime<Utc>>,
    algorithm: DigestAlgorithm,
    /// Digest of the backing file at the last store or restore
    synced_digest: Option<Digest>,
    /// A restore merged into pre-existing keys the file does not hold
    merged_extra: bool,
}

impl<K, V> PersistentMap<K, V>
where
    K: Eq + Hash + Serialize + DeserializeOwned,
    V: PartialEq + Serialize + DeserializeOwned,
{
    /// Bind to `path` using the default digest algorithm
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        Self::bind(Some(path.as_ref()), DigestAlgorithm::default())
    }

    /// Bind to `path` using the given digest algorithm
    pub fn open_with(path: impl AsRef<Path>, algorithm: DigestAlgorithm) -> Result<Self, PersistError> {
        Self::bind(Some(path.as_ref()), algorithm)
    }

    /// Bind to a backing file, creating it if needed and restoring from it
    /// when it is non-empty.
    ///
    /// Fails with [`PersistError::InvalidBackingFile`] when no path is given,
    /// the path is empty or a directory, or the file or its directory is not
    /// writable. A non-empty file that cannot be restored fails with
    /// [`PersistError::RestoreFailed`].
    pub fn bind(path: Option<&Path>, algorithm: DigestAlgorithm) -> Result<Self, PersistError> {
        let path = match path {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => {
                return Err(PersistError::InvalidBackingFile {
                    path: path.map(Path::to_path_buf).unwrap_or_default(),
                    reason: "no backing file path given".to_string(),
                })
            }
        };

        let invalid = |reason: String| PersistError::InvalidBackingFile {
            path: path.to_path_buf(),
            reason,
        };

        if path.is_dir() {
            return Err(invalid("path is a directory".to_string()));
        }

        // Opening for write both creates a missing file and proves the
        // location is writable. The handle is dropped at the end of the block.
        let len = {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| invalid(format!("not writable: {}", e)))?;
            let metadata = file
                .metadata()
                .map_err(|e| invalid(format!("cannot stat: {}", e)))?;
            if !metadata.is_file() {
                return Err(invalid("not a regular file".to_string()));
            }
            metadata.len()
        };

        // Stores replace the file through a temp file next to it, so the
        // directory must accept new files too.
        let target = resolve_target(path);
        NamedTempFile::new_in(parent_dir(&target))
            .map_err(|e| invalid(format!("directory not writable: {}", e)))?;

        let mut map = Self {
            entries: HashMap::new(),
            backing_path: path.to_path_buf(),
            dirty: false,
            last_store_time: None,
            algorithm,
            synced_digest: None,
            merged_extra: false,
        };

        if len == 0 {
            debug!(path = %path.display(), "Bound to empty backing file");
            map.synced_digest = Some(digest_bytes(&[], algorithm));
        } else {
            map.restore().map_err(|e| PersistError::RestoreFailed {
                path: path.to_path_buf(),
                source: Box::new(e),
            })?;
            info!(
                path = %path.display(),
                entries = map.entries.len(),
                "Restored persistent map"
            );
        }

        Ok(map)
    }

    /// Decode a backing file into a plain map without binding to it
    pub fn load_entries(path: &Path) -> Result<HashMap<K, V>, PersistError> {
        let bytes = read_backing(path)?;
        Ok(decode_record::<K, V>(path, &bytes)?.entries)
    }

    /// Write the whole map to the backing file, replacing its contents.
    ///
    /// On failure the dirty flag, the last store time and the previous file
    /// contents are all left as they were.
    pub fn store(&mut self) -> Result<(), PersistError> {
        if self.is_synchronized() {
            debug!(path = %self.backing_path.display(), "Backing file already up to date");
            return Ok(());
        }

        let now = Utc::now();
        let stamp = match self.last_store_time {
            Some(prev) if prev > now => prev,
            _ => now,
        };

        let record = StoreRecordRef {
            entries: &self.entries,
            last_store_time: Some(stamp),
        };
        let body = rmp_serde::to_vec(&record).map_err(|e| self.store_error(e))?;
        let mut bytes = Vec::with_capacity(STORE_MAGIC.len() + body.len());
        bytes.extend_from_slice(STORE_MAGIC);
        bytes.extend_from_slice(&body);

        write_atomically(&self.backing_path, &bytes).map_err(|e| self.store_error(e))?;

        self.last_store_time = Some(stamp);
        self.synced_digest = Some(digest_bytes(&bytes, self.algorithm));
        self.merged_extra = false;
        self.dirty = false;

        info!(
            path = %self.backing_path.display(),
            entries = self.entries.len(),
            bytes = bytes.len(),
            "Stored persistent map"
        );
        Ok(())
    }

    /// Merge the backing file's stored entries into this map.
    ///
    /// Restored keys overwrite existing ones; keys only present in memory are
    /// kept. The file is fully decoded before anything in memory changes.
    pub fn restore(&mut self) -> Result<(), PersistError> {
        let bytes = read_backing(&self.backing_path)?;
        let record = decode_record::<K, V>(&self.backing_path, &bytes)?;

        let restored = record.entries.len();
        self.entries.extend(record.entries);
        self.merged_extra = self.entries.len() != restored;
        self.last_store_time = self.last_store_time.max(record.last_store_time);
        self.synced_digest = Some(digest_bytes(&bytes, self.algorithm));
        self.dirty = false;

        debug!(
            path = %self.backing_path.display(),
            restored,
            total = self.entries.len(),
            "Merged stored entries"
        );
        Ok(())
    }

    /// Digest of the backing file's current bytes
    pub fn digest(&self) -> Result<Digest, PersistError> {
        digest_file(&self.backing_path, self.algorithm)
    }

    /// Whether the backing file changed since this map last stored or
    /// restored it
    pub fn has_external_changes(&self) -> Result<bool, PersistError> {
        let current = self.digest()?;
        Ok(self.synced_digest.as_ref() != Some(&current))
    }

    // Clean, previously persisted, and the file still holds our bytes.
    fn is_synchronized(&self) -> bool {
        if self.dirty || self.merged_extra || self.last_store_time.is_none() {
            return false;
        }
        match (&self.synced_digest, self.digest()) {
            (Some(synced), Ok(current)) => *synced == current,
            (_, Err(e)) => {
                warn!(path = %self.backing_path.display(), error = %e, "Cannot digest backing file");
                false
            }
            _ => false,
        }
    }

    fn store_error(&self, e: impl std::fmt::Display) -> PersistError {
        PersistError::StoreError {
            path: self.backing_path.clone(),
            reason: e.to_string(),
        }
    }

    /// Insert a value, marking the map dirty only if the content changed.
    /// Returns the previous value.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let changed = self.entries.get(&key).map_or(true, |prior| *prior != value);
        let prior = self.entries.insert(key, value);
        if changed {
            self.dirty = true;
        }
        prior
    }

    /// Force the dirty flag.
    ///
    /// `true` makes the next [`store`](Self::store) rewrite the file even
    /// when nothing changed; `false` declares memory and file in sync.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Insert a value, always marking the map dirty
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.dirty = true;
        self.entries.insert(key, value)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Change-tracked insert of every pair
    pub fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.put(key, value);
        }
    }
}

impl<K: Eq + Hash, V> PersistentMap<K, V> {
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    /// Read-only view of the entries
    pub fn entries(&self) -> &HashMap<K, V> {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_store_time(&self) -> Option<DateTime<Utc>> {
        self.last_store_time
    }

    pub fn path(&self) -> &Path {
        &self.backing_path
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }
}

fn read_backing(path: &Path) -> Result<Vec<u8>, PersistError> {
    std::fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PersistError::FileNotFound(path.to_path_buf()),
        _ => PersistError::IoError(e),
    })
}

fn decode_record<K, V>(path: &Path, bytes: &[u8]) -> Result<StoreRecord<K, V>, PersistError>
where
    K: Eq + Hash + DeserializeOwned,
    V: DeserializeOwned,
{
    let corrupt = |reason: String| PersistError::CorruptStore {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.is_empty() {
        return Err(corrupt("file is empty".to_string()));
    }
    let body = bytes
        .strip_prefix(STORE_MAGIC.as_slice())
        .ok_or_else(|| corrupt("missing store header".to_string()))?;

    let mut cursor = Cursor::new(body);
    let record: StoreRecord<K, V> =
        rmp_serde::from_read(&mut cursor).map_err(|e| corrupt(e.to_string()))?;
    if cursor.position() != body.len() as u64 {
        return Err(corrupt("trailing bytes after record".to_string()));
    }
    Ok(record)
}

/// Follow symlinks so the rename replaces the real file, not the link
fn resolve_target(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let target = resolve_target(path);

    let mut tmp = NamedTempFile::new_in(parent_dir(&target))?;
    if let Ok(metadata) = std::fs::metadata(&target) {
        tmp.as_file().set_permissions(metadata.permissions())?;
    }
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}
