//! TTL disk cache for skin records
//!
//! One file per record under the cache directory, value bytes in the shared
//! binary record layout. An in-memory index fronts the directory; the
//! directory is the source of truth across restarts. A periodic sweep evicts
//! expired records from both.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::CodecError;
use crate::skins::CachedSkin;
use crate::util::time::unix_millis;

const RECORD_EXT: &str = "bin";

/// Cache errors. I/O failures indicate infrastructure problems and are
/// surfaced loudly by callers; codec failures quarantine a single record.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored record is malformed: {0}")]
    Codec(#[from] CodecError),
}

/// Persistent key-value store of skin records with TTL sweep
pub struct SkinCache {
    dir: PathBuf,
    index: DashMap<String, CachedSkin>,
    // Per-key critical sections. Any path that touches both the record file
    // and the index for one key runs under that key's lock, so a miss being
    // populated from disk can never clobber a concurrent `set`, and the sweep
    // can never unlink a record refreshed after it was collected.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SkinCache {
    /// Open (creating if needed) the cache directory and start the expiry
    /// sweeper. The sweep task holds a [`Weak`] reference and exits on its
    /// own when the cache is dropped; [`dispose`](SkinCache::dispose) stops
    /// it eagerly.
    pub async fn open(dir: impl Into<PathBuf>, sweep_interval: Duration) -> Result<Arc<Self>, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let cache = Arc::new(Self {
            dir,
            index: DashMap::new(),
            locks: DashMap::new(),
            sweeper: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&cache);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep_expired().await,
                    None => break,
                }
            }
        });

        *cache.sweeper.lock() = Some(handle);
        Ok(cache)
    }

    /// Stop the sweeper task. Idempotent.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Look up a record by its normalized uuid. Absence is a normal miss,
    /// not an error; a corrupt on-disk record is dropped and reported as a
    /// miss. Expiry is enforced by the sweep, not here.
    pub async fn get(&self, uuid: &str) -> Result<Option<CachedSkin>, CacheError> {
        if let Some(record) = self.index.get(uuid) {
            return Ok(Some(record.clone()));
        }

        let lock = self.key_lock(uuid);
        let _guard = lock.lock().await;

        // A set may have landed while we waited on the lock; the index is
        // fresher than whatever the file held when we first missed.
        if let Some(record) = self.index.get(uuid) {
            return Ok(Some(record.clone()));
        }

        let path = self.record_path(uuid);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match CachedSkin::decode(&mut raw.as_slice()) {
            Ok(record) => {
                self.index.insert(uuid.to_string(), record.clone());
                Ok(Some(record))
            }
            Err(e) => {
                warn!(uuid, error = %e, "Dropping corrupt cache record");
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Write a record through to disk and the index, replacing any prior
    /// record under the same key. The file lands via temp-file + rename so a
    /// concurrent `get` never observes a half-written record.
    pub async fn set(&self, record: CachedSkin) -> Result<(), CacheError> {
        let lock = self.key_lock(&record.uuid);
        let _guard = lock.lock().await;

        let path = self.record_path(&record.uuid);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.uuid, Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, record.encode()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.index.insert(record.uuid.clone(), record);
        Ok(())
    }

    /// Evict expired records from memory and disk.
    pub async fn sweep_expired(&self) {
        self.sweep_expired_at(unix_millis()).await
    }

    /// Sweep against an explicit clock, for deterministic tests. A single
    /// bad record never aborts the iteration.
    pub async fn sweep_expired_at(&self, now: u64) {
        // Indexed records first
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for uuid in expired {
            let lock = self.key_lock(&uuid);
            let guard = lock.lock().await;

            // Re-check under the lock: a set may have refreshed the record
            // between collection and eviction, and that record stays.
            let removed = self
                .index
                .remove_if(&uuid, |_, record| record.expires_at <= now)
                .is_some();
            if removed {
                if let Err(e) = tokio::fs::remove_file(self.record_path(&uuid)).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!(uuid, error = %e, "Failed to unlink expired cache record");
                    }
                }
                debug!(uuid, "Evicted expired skin record");
            }

            drop(guard);
            drop(lock);
            self.prune_lock(&uuid);
        }

        // Then on-disk records never loaded this run (left over from a
        // previous process lifetime)
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, dir = %self.dir.display(), "Cache sweep cannot read directory");
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Cache sweep failed mid-iteration");
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let uuid = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            if self.index.contains_key(&uuid) {
                continue;
            }

            let lock = self.key_lock(&uuid);
            let guard = lock.lock().await;

            // A get or set may have indexed this key while we waited
            if self.index.contains_key(&uuid) {
                drop(guard);
                drop(lock);
                self.prune_lock(&uuid);
                continue;
            }

            let drop_file = match tokio::fs::read(&path).await {
                Ok(raw) => match CachedSkin::decode(&mut raw.as_slice()) {
                    Ok(record) => record.expires_at <= now,
                    Err(e) => {
                        warn!(uuid, error = %e, "Dropping corrupt cache record during sweep");
                        true
                    }
                },
                Err(_) => false,
            };

            if drop_file {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    error!(uuid, error = %e, "Failed to unlink swept cache record");
                } else {
                    debug!(uuid, "Evicted expired skin record from disk");
                }
            }

            drop(guard);
            drop(lock);
            self.prune_lock(&uuid);
        }
    }

    fn key_lock(&self, uuid: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(uuid.to_string()).or_default().clone()
    }

    // Drop a key's lock entry once nothing holds it. Cloning out of the map
    // goes through the same shard lock as `remove_if`, so the strong count
    // cannot change under the check.
    fn prune_lock(&self, uuid: &str) {
        self.locks
            .remove_if(uuid, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of records currently indexed in memory.
    pub fn indexed_records(&self) -> usize {
        self.index.len()
    }

    fn record_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{uuid}.{RECORD_EXT}"))
    }
}

impl Drop for SkinCache {
    fn drop(&mut self) {
        self.dispose();
    }
}
