//! Key-value persistence.
//!
//! All durable state (container registrations, cluster configurations,
//! node records) is written through a small hierarchical KV abstraction.
//! Keys are `/`-separated paths under a configured prefix. The trait keeps
//! the registries testable with an in-memory store while production runs
//! on the file-backed store, which survives restarts and is the source of
//! truth on startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Errors from KV operations.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("IO error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Serialization failed for '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp {
    Put,
    Delete,
}

/// Change notification delivered to watchers.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub op: KvOp,
}

/// Hierarchical key-value store with watch, compare-and-set and TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Set `key` only when its current value equals `expect` (None means
    /// "absent"). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, KvError>;

    /// Set with a time-to-live; the key disappears after `ttl`.
    async fn set_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Delete every key under `prefix`.
    async fn delete_dir(&self, prefix: &str) -> Result<(), KvError>;

    /// List keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Subscribe to changes under `prefix`. Per-prefix delivery is FIFO.
    fn watch(&self, prefix: &str) -> broadcast::Receiver<KvEvent>;
}

/// Serialize a record and write it through.
pub async fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), KvError> {
    let bytes = serde_json::to_vec(value).map_err(|source| KvError::Codec {
        key: key.to_string(),
        source,
    })?;
    store.set(key, bytes).await
}

/// Read and deserialize a record. A missing key yields None; an
/// undecodable record is logged and treated as missing so one corrupt
/// entry cannot wedge a startup load.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match store.get(key).await? {
        None => Ok(None),
        Some(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Undecodable record at '{}': {}", key, e);
                Ok(None)
            }
        },
    }
}

/// Join key segments, normalizing duplicate separators.
pub fn join(prefix: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}

const WATCH_CAPACITY: usize = 256;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

struct Watchers {
    channels: DashMap<String, broadcast::Sender<KvEvent>>,
}

impl Watchers {
    fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn subscribe(&self, prefix: &str) -> broadcast::Receiver<KvEvent> {
        self.channels
            .entry(prefix.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .subscribe()
    }

    fn notify(&self, key: &str, op: KvOp) {
        for entry in self.channels.iter() {
            if key.starts_with(entry.key().as_str()) {
                // Send fails only when nobody is listening any more.
                let _ = entry.value().send(KvEvent {
                    key: key.to_string(),
                    op,
                });
            }
        }
    }
}

/// In-memory store, used by tests and as the cache layer of the file
/// store.
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
    watchers: Watchers,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            watchers: Watchers::new(),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let expired = match self.entries.get(key) {
            Some(e) if e.live() => return Ok(Some(e.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        self.watchers.notify(key, KvOp::Put);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, KvError> {
        let entry = self.entries.entry(key.to_string());
        let swapped = match entry {
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                let current = if o.get().live() {
                    Some(o.get().value.as_slice())
                } else {
                    None
                };
                if current == expect {
                    o.insert(Entry {
                        value,
                        expires_at: None,
                    });
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                if expect.is_none() {
                    v.insert(Entry {
                        value,
                        expires_at: None,
                    });
                    true
                } else {
                    false
                }
            }
        };
        if swapped {
            self.watchers.notify(key, KvOp::Put);
        }
        Ok(swapped)
    }

    async fn set_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        self.watchers.notify(key, KvOp::Put);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        if self.entries.remove(key).is_some() {
            self.watchers.notify(key, KvOp::Delete);
        }
        Ok(())
    }

    async fn delete_dir(&self, prefix: &str) -> Result<(), KvError> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.entries.remove(&key);
            self.watchers.notify(&key, KvOp::Delete);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().live())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn watch(&self, prefix: &str) -> broadcast::Receiver<KvEvent> {
        self.watchers.subscribe(prefix)
    }
}

/// File-backed store: one file per key under a root directory. Writes are
/// mirrored in memory so reads stay cheap; the directory tree is what
/// survives a restart.
pub struct FileKvStore {
    root: PathBuf,
    cache: MemoryKvStore,
}

impl FileKvStore {
    /// Open (creating the directory when absent) and load existing keys.
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, KvError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| KvError::Io {
            key: root.display().to_string(),
            source,
        })?;
        let store = Self {
            root: root.clone(),
            cache: MemoryKvStore::new(),
        };
        store.load_dir(&root)?;
        debug!("Opened KV store at {}", root.display());
        Ok(Arc::new(store))
    }

    fn load_dir(&self, dir: &Path) -> Result<(), KvError> {
        let entries = std::fs::read_dir(dir).map_err(|source| KvError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.load_dir(&path)?;
            } else if let Some(key) = self.key_of(&path) {
                match std::fs::read(&path) {
                    Ok(value) => {
                        self.cache.entries.insert(
                            key,
                            Entry {
                                value,
                                expires_at: None,
                            },
                        );
                    }
                    Err(e) => warn!("Skipping unreadable key file {}: {}", path.display(), e),
                }
            }
        }
        Ok(())
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, KvError> {
        if key.is_empty() || key.split('/').any(|s| s == ".." || s == ".") {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key.trim_start_matches('/')))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| KvError::Io {
                key: key.to_string(),
                source,
            })?;
        }
        std::fs::write(&path, value).map_err(|source| KvError::Io {
            key: key.to_string(),
            source,
        })
    }

    fn remove_file(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_of(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(KvError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.cache.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.write_file(key, &value)?;
        self.cache.set(key, value).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool, KvError> {
        let swapped = self
            .cache
            .compare_and_set(key, expect, value.clone())
            .await?;
        if swapped {
            self.write_file(key, &value)?;
        }
        Ok(swapped)
    }

    async fn set_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        // TTL entries are ephemeral; they stay out of the file tree.
        self.cache.set_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.remove_file(key)?;
        self.cache.delete(key).await
    }

    async fn delete_dir(&self, prefix: &str) -> Result<(), KvError> {
        let path = self.path_of(prefix)?;
        // The prefix may name a directory, a single key, or both forms may
        // be gone already.
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => self.remove_file(prefix)?,
        }
        self.cache.delete_dir(prefix).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.cache.list(prefix).await
    }

    fn watch(&self, prefix: &str) -> broadcast::Receiver<KvEvent> {
        self.cache.watch(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let kv = MemoryKvStore::new();
        kv.set("a/b", b"one".to_vec()).await.unwrap();
        assert_eq!(kv.get("a/b").await.unwrap(), Some(b"one".to_vec()));

        kv.delete("a/b").await.unwrap();
        assert_eq!(kv.get("a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_list_and_delete_dir() {
        let kv = MemoryKvStore::new();
        kv.set("p/x", b"1".to_vec()).await.unwrap();
        kv.set("p/y", b"2".to_vec()).await.unwrap();
        kv.set("q/z", b"3".to_vec()).await.unwrap();

        assert_eq!(kv.list("p/").await.unwrap(), vec!["p/x", "p/y"]);

        kv.delete_dir("p/").await.unwrap();
        assert!(kv.list("p/").await.unwrap().is_empty());
        assert_eq!(kv.get("q/z").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let kv = MemoryKvStore::new();

        // Create iff absent.
        assert!(kv.compare_and_set("k", None, b"a".to_vec()).await.unwrap());
        assert!(!kv.compare_and_set("k", None, b"b".to_vec()).await.unwrap());

        // Swap on expected value only.
        assert!(kv
            .compare_and_set("k", Some(b"a"), b"b".to_vec())
            .await
            .unwrap());
        assert!(!kv
            .compare_and_set("k", Some(b"a"), b"c".to_vec())
            .await
            .unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = MemoryKvStore::new();
        kv.set_ttl("t", b"x".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(kv.get("t").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.get("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let kv = MemoryKvStore::new();
        let mut rx = kv.watch("w/");

        kv.set("w/a", b"1".to_vec()).await.unwrap();
        kv.set("other", b"2".to_vec()).await.unwrap();
        kv.delete("w/a").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "w/a");
        assert_eq!(first.op, KvOp::Put);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.op, KvOp::Delete);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = FileKvStore::open(dir.path()).unwrap();
            kv.set("fleet/containers/abc", b"{}".to_vec()).await.unwrap();
        }
        // Reopen: state must survive.
        let kv = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(
            kv.get("fleet/containers/abc").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert_eq!(
            kv.list("fleet/containers").await.unwrap(),
            vec!["fleet/containers/abc"]
        );
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let kv = MemoryKvStore::new();
        put_json(&kv, "j", &vec![1, 2, 3]).await.unwrap();
        let back: Option<Vec<i32>> = get_json(&kv, "j").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = get_json(&kv, "nope").await.unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("fleet/", "/nodes"), "fleet/nodes");
        assert_eq!(join("fleet", "nodes"), "fleet/nodes");
    }
}
