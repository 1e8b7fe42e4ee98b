//! Memoized task results
//!
//! Results are stored as JSON under their fingerprint: a hash of the commit,
//! the task definition, the backend identity and the requirements hash. Entries
//! are written once and never updated. A store is checked with a write and a
//! read-back when the runner starts.

pub mod store;

pub use store::{CacheStore, FileStore, MemoryStore, NullStore};

use crate::config::CacheConfig;
use crate::errors::{PinrunError, Result};
use crate::task::{Task, TaskResult};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Key written by the startup self-test.
pub const SELF_TEST_KEY: &str = "pinrun_last_run";

pub fn fingerprint(commit_id: &str, task: &Task, backend_identity: &str, requirements_hash: &str) -> String {
    let task_hash = task.hash();
    let mut hasher = Sha256::new();
    for part in [commit_id, task_hash.as_str(), backend_identity, requirements_hash] {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct ResultCache {
    store: Option<Arc<dyn CacheStore>>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// The `null` kind disables caching altogether and skips the self-test.
    pub fn from_config(config: &CacheConfig) -> Self {
        match config {
            CacheConfig::Null => Self::disabled(),
            CacheConfig::Memory => Self::new(Arc::new(MemoryStore::new())),
            CacheConfig::File { path } => Self::new(Arc::new(FileStore::new(path.clone()))),
        }
    }

    /// Builds the cache and runs the self-test. With `ignore_errors` a failing
    /// store is reported and replaced by a disabled cache.
    pub async fn checked(config: &CacheConfig, ignore_errors: bool) -> Result<Self> {
        let cache = Self::from_config(config);
        match cache.self_test().await {
            Ok(()) => Ok(cache),
            Err(e) if ignore_errors => {
                log::warn!("Cache is not working, running without it: {}", e);
                Ok(Self::disabled())
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn self_test(&self) -> Result<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };

        let stamp = chrono::Utc::now().to_rfc3339();
        store
            .set(SELF_TEST_KEY, stamp.clone().into_bytes())
            .await
            .map_err(|e| PinrunError::Configuration(format!("Cache is misconfigured, write failed: {}", e)))?;
        let read = store
            .get(SELF_TEST_KEY)
            .await
            .map_err(|e| PinrunError::Configuration(format!("Cache is misconfigured, read failed: {}", e)))?;

        if read.as_deref() != Some(stamp.as_bytes()) {
            return Err(PinrunError::Configuration(
                "Cache is misconfigured, a value written to it could not be read back".to_string(),
            ));
        }
        log::debug!("Cache self-test passed");
        Ok(())
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<TaskResult>> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(None),
        };

        match store.get(fingerprint).await? {
            Some(bytes) => match serde_json::from_slice::<TaskResult>(&bytes) {
                Ok(result) => {
                    log::info!("Cache hit for {}", fingerprint);
                    Ok(Some(result))
                }
                Err(e) => {
                    log::warn!("Ignoring unreadable cache entry {}: {}", fingerprint, e);
                    Ok(None)
                }
            },
            None => {
                log::debug!("Cache miss for {}", fingerprint);
                Ok(None)
            }
        }
    }

    pub async fn put(&self, fingerprint: &str, result: &TaskResult) -> Result<()> {
        if let Some(store) = &self.store {
            store.set(fingerprint, serde_json::to_vec(result)?).await?;
            log::debug!("Stored result for {}", fingerprint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    /// Drops every write, like a store pointed at a dead server.
    struct BlackHole;

    #[async_trait]
    impl CacheStore for BlackHole {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl CacheStore for Broken {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(PinrunError::Io("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(PinrunError::Io("connection refused".to_string()))
        }
    }

    fn result() -> TaskResult {
        TaskResult {
            output: json!(5),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_fingerprint_depends_on_every_part() {
        let task = Task::new("mod:add").unwrap().with_args(vec![json!(2), json!(3)]);
        let base = fingerprint("abc", &task, "subprocess", "no_requirements");

        assert_eq!(base, fingerprint("abc", &task, "subprocess", "no_requirements"));
        assert_ne!(base, fingerprint("abd", &task, "subprocess", "no_requirements"));
        assert_ne!(base, fingerprint("abc", &task, "environment", "no_requirements"));
        assert_ne!(base, fingerprint("abc", &task, "subprocess", "deadbeef"));
        let other = Task::new("mod:add").unwrap().with_args(vec![json!(3), json!(2)]);
        assert_ne!(base, fingerprint("abc", &other, "subprocess", "no_requirements"));
    }

    #[test]
    fn test_timeout_is_not_part_of_fingerprint() {
        let task = Task::new("mod:add").unwrap();
        let slower = Task::new("mod:add").unwrap().with_timeout(30).unwrap();
        assert_eq!(
            fingerprint("abc", &task, "subprocess", "x"),
            fingerprint("abc", &slower, "subprocess", "x")
        );
    }

    #[tokio::test]
    async fn test_memory_cache_round() {
        let cache = ResultCache::checked(&CacheConfig::Memory, false).await.unwrap();
        assert!(cache.is_enabled());
        assert_eq!(cache.get("fp").await.unwrap(), None);

        cache.put("fp", &result()).await.unwrap();
        assert_eq!(cache.get("fp").await.unwrap(), Some(result()));
    }

    #[tokio::test]
    async fn test_null_cache_is_disabled() {
        let cache = ResultCache::checked(&CacheConfig::Null, false).await.unwrap();
        assert!(!cache.is_enabled());
        cache.put("fp", &result()).await.unwrap();
        assert_eq!(cache.get("fp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_cache_self_test_writes_stamp() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::File {
            path: dir.path().join("cache"),
        };
        ResultCache::checked(&config, false).await.unwrap();
        assert!(dir.path().join("cache").join(SELF_TEST_KEY).is_file());
    }

    #[tokio::test]
    async fn test_self_test_failures() {
        let lossy = ResultCache::new(Arc::new(BlackHole));
        assert!(matches!(
            lossy.self_test().await,
            Err(PinrunError::Configuration(_))
        ));

        let broken = ResultCache::new(Arc::new(Broken));
        match broken.self_test().await {
            Err(PinrunError::Configuration(message)) => assert!(message.contains("connection refused")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ignored_errors_disable_cache() {
        let dir = TempDir::new().unwrap();
        // A file where the cache directory should be makes every write fail.
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, "not a directory").unwrap();
        let config = CacheConfig::File { path: blocker };

        assert!(ResultCache::checked(&config, false).await.is_err());
        let cache = ResultCache::checked(&config, true).await.unwrap();
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set("fp", b"not json".to_vec()).await.unwrap();
        let cache = ResultCache::new(store);
        assert_eq!(cache.get("fp").await.unwrap(), None);
    }
}
