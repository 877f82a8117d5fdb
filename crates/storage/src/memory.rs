//! In-process object store for tests and single-process deployments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::{validate_key, ObjectStore, Result, StorageError};

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Vec<u8>>,
    /// Number of upcoming operations that fail with `Transient`.
    pending_failures: usize,
    /// Keys whose every operation fails with `Transient`.
    unavailable: BTreeSet<String>,
}

/// Object store backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(inner: &mut Inner, op: &str, key: &str) -> Result<()> {
        if inner.unavailable.contains(key) {
            debug!(op, key, "key unavailable");
            return Err(StorageError::Transient(format!("{op} {key}: unavailable")));
        }
        if inner.pending_failures > 0 {
            inner.pending_failures -= 1;
            debug!(op, key, "injected transient failure");
            return Err(StorageError::Transient(format!("{op} {key}: injected")));
        }
        Ok(())
    }

    /// Make the next `count` operations fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.lock().pending_failures = count;
    }

    /// Fail every operation on `key` until [`MemoryStore::restore`] is called.
    pub fn make_unavailable(&self, key: &str) {
        self.lock().unavailable.insert(key.to_string());
    }

    pub fn restore(&self, key: &str) {
        self.lock().unavailable.remove(key);
    }

    /// Unconditionally write `key`, replacing any existing object.
    pub fn overwrite(&self, key: &str, bytes: Vec<u8>) {
        self.lock().objects.insert(key.to_string(), bytes);
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner, "list", prefix)?;
        Ok(inner
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let mut inner = self.lock();
        Self::take_failure(&mut inner, "get", key)?;
        Ok(inner.objects.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        let mut inner = self.lock();
        Self::take_failure(&mut inner, "put", key)?;
        if inner.objects.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        inner.objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
