//! In-memory backend with etcd-like revisions.

use super::{Backend, RawEntry, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    revision: i64,
    entries: BTreeMap<String, (String, i64)>,
}

/// Single-process store. Every write bumps a global revision, like etcd's
/// `mod_revision`.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl Inner {
    fn write(&mut self, key: &str, value: String) {
        self.revision += 1;
        self.entries.insert(key.to_string(), (value, self.revision));
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.entries.get(key).map(|(value, revision)| RawEntry {
            key: key.to_string(),
            value: value.clone(),
            revision: *revision,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RawEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, revision))| RawEntry {
                key: key.clone(),
                value: value.clone(),
                revision: *revision,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.lock()?.write(key, value);
        Ok(())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let current = inner.entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_revision {
            return Ok(false);
        }
        inner.write(key, value);
        Ok(true)
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_respects_prefix() {
        let backend = MemoryBackend::new();
        backend.put("/a/1", "one".into()).await.unwrap();
        backend.put("/a/2", "two".into()).await.unwrap();
        backend.put("/b/1", "other".into()).await.unwrap();

        let listed = backend.list("/a/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.key.starts_with("/a/")));
    }

    #[tokio::test]
    async fn test_revisions_increase_per_write() {
        let backend = MemoryBackend::new();
        backend.put("/k", "v1".into()).await.unwrap();
        let first = backend.get("/k").await.unwrap().unwrap().revision;
        backend.put("/other", "x".into()).await.unwrap();
        backend.put("/k", "v2".into()).await.unwrap();
        let second = backend.get("/k").await.unwrap().unwrap().revision;
        assert!(second > first);

        assert!(!backend.compare_and_put("/k", first, "v3".into()).await.unwrap());
        assert!(backend.compare_and_put("/k", second, "v3".into()).await.unwrap());
        assert!(!backend.compare_and_put("/new", 5, "x".into()).await.unwrap());
        assert!(backend.compare_and_put("/new", 0, "x".into()).await.unwrap());
    }
}
