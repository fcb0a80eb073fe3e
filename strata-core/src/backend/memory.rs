//! In-memory object store with fault injection

use super::ObjectStore;
use crate::{Result, StrataError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::time::Duration;

/// Kind of error an injected fault produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Permanent,
}

impl FaultKind {
    fn error(self, key: &str) -> StrataError {
        match self {
            FaultKind::Transient => StrataError::Transient(format!("injected fault on {}", key)),
            FaultKind::Permanent => StrataError::Permanent(format!("injected fault on {}", key)),
        }
    }
}

/// Number of calls made against the store, by operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub list: u64,
    pub get: u64,
    pub put: u64,
    pub delete: u64,
}

#[derive(Default)]
struct Faults {
    fail_next: usize,
    fail_next_kind: Option<FaultKind>,
    key_faults: Vec<(String, FaultKind)>,
    latency: Duration,
}

/// Bucket held entirely in memory
///
/// Used by tests and benchmarks in place of a real object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    faults: Mutex<Faults>,
    calls: Mutex<StoreCalls>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls of any kind
    pub fn fail_next(&self, n: usize, kind: FaultKind) {
        let mut faults = self.faults.lock();
        faults.fail_next = n;
        faults.fail_next_kind = Some(kind);
    }

    /// Fail every call whose key or prefix contains `pattern`
    pub fn fail_keys_containing(&self, pattern: impl Into<String>, kind: FaultKind) {
        self.faults.lock().key_faults.push((pattern.into(), kind));
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = latency;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn calls(&self) -> StoreCalls {
        *self.calls.lock()
    }

    pub fn reset_calls(&self) {
        *self.calls.lock() = StoreCalls::default();
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    async fn before_call(&self, key: &str) -> Result<()> {
        let latency = {
            let mut faults = self.faults.lock();

            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                if let Some(kind) = faults.fail_next_kind {
                    return Err(kind.error(key));
                }
            }

            if let Some((_, kind)) = faults
                .key_faults
                .iter()
                .find(|(pattern, _)| key.contains(pattern.as_str()))
            {
                return Err(kind.error(key));
            }

            faults.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.calls.lock().list += 1;
        self.before_call(prefix).await?;

        let objects = self.objects.read();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.calls.lock().get += 1;
        self.before_call(key).await?;

        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.calls.lock().put += 1;
        self.before_call(key).await?;

        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.calls.lock().delete += 1;
        self.before_call(key).await?;

        self.objects.write().remove(key);
        Ok(())
    }
}
