//! Typed access to blocks and tenant indexes on top of an [`ObjectStore`]

use super::{
    block_prefix, compacted_meta_key, meta_key, object_key, tenant_index_key, ObjectStore,
    COMPACTED_META_NAME, META_NAME,
};
use crate::index::TenantIndex;
use crate::{BlockMeta, Result, StrataError, Timestamp};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Block-level reader/writer with a deadline on every store call
#[derive(Clone)]
pub struct Backend {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl Backend {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn call<T, F>(&self, operation: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StrataError::Timeout {
                operation: format!("{} {}", operation, key),
                millis: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Tenants with at least one object in the bucket
    pub async fn tenants(&self) -> Result<Vec<String>> {
        self.call("list_dirs", "/", self.store.list_dirs("")).await
    }

    /// Live and compacted block IDs for a tenant
    ///
    /// A block with both metas present (compaction interrupted between the
    /// two writes) is reported as compacted.
    pub async fn blocks(&self, tenant: &str) -> Result<(Vec<Uuid>, Vec<Uuid>)> {
        let prefix = format!("{}/", tenant);
        let keys = self.call("list", &prefix, self.store.list(&prefix)).await?;

        let mut live = BTreeSet::new();
        let mut compacted = BTreeSet::new();

        for key in &keys {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((block, name)) = rest.split_once('/') else {
                continue;
            };
            let Ok(block_id) = Uuid::parse_str(block) else {
                debug!(tenant, key = %key, "ignoring object outside a block directory");
                continue;
            };
            match name {
                META_NAME => {
                    live.insert(block_id);
                }
                COMPACTED_META_NAME => {
                    compacted.insert(block_id);
                }
                _ => {}
            }
        }

        live.retain(|id| !compacted.contains(id));
        Ok((live.into_iter().collect(), compacted.into_iter().collect()))
    }

    pub async fn block_meta(&self, tenant: &str, block_id: Uuid) -> Result<BlockMeta> {
        let key = meta_key(tenant, block_id);
        let data = self.call("get", &key, self.store.get(&key)).await?;
        let meta: BlockMeta =
            serde_json::from_slice(&data).map_err(|e| StrataError::decode(&key, e))?;
        meta.validate()?;
        Ok(meta)
    }

    pub async fn compacted_block_meta(&self, tenant: &str, block_id: Uuid) -> Result<BlockMeta> {
        let key = compacted_meta_key(tenant, block_id);
        let data = self.call("get", &key, self.store.get(&key)).await?;
        let meta: BlockMeta =
            serde_json::from_slice(&data).map_err(|e| StrataError::decode(&key, e))?;
        if meta.compacted_at.is_none() {
            return Err(StrataError::decode(&key, "missing compactedTime"));
        }
        meta.validate()?;
        Ok(meta)
    }

    /// Write `meta.json`, making the block visible
    pub async fn write_block_meta(&self, meta: &BlockMeta) -> Result<()> {
        let key = meta_key(&meta.tenant_id, meta.block_id);
        let data = serde_json::to_vec(meta).map_err(|e| StrataError::Internal(e.to_string()))?;
        self.call("put", &key, self.store.put(&key, Bytes::from(data)))
            .await
    }

    /// Write the compacted meta, then remove the live one
    pub async fn mark_block_compacted(
        &self,
        tenant: &str,
        block_id: Uuid,
        at: Timestamp,
    ) -> Result<BlockMeta> {
        let meta = self.block_meta(tenant, block_id).await?.compacted(at);

        let key = compacted_meta_key(tenant, block_id);
        let data = serde_json::to_vec(&meta).map_err(|e| StrataError::Internal(e.to_string()))?;
        self.call("put", &key, self.store.put(&key, Bytes::from(data)))
            .await?;

        let live = meta_key(tenant, block_id);
        self.call("delete", &live, self.store.delete(&live)).await?;

        Ok(meta)
    }

    /// Delete every object of a block, metas first so pollers stop seeing it
    pub async fn clear_block(&self, tenant: &str, block_id: Uuid) -> Result<()> {
        let prefix = block_prefix(tenant, block_id);
        let keys = self.call("list", &prefix, self.store.list(&prefix)).await?;

        let (metas, rest): (Vec<_>, Vec<_>) = keys.into_iter().partition(|k| {
            k.ends_with(&format!("/{}", META_NAME)) || k.ends_with(&format!("/{}", COMPACTED_META_NAME))
        });

        for key in metas.iter().chain(rest.iter()) {
            self.call("delete", key, self.store.delete(key)).await?;
        }
        Ok(())
    }

    pub async fn tenant_index(&self, tenant: &str) -> Result<TenantIndex> {
        let key = tenant_index_key(tenant);
        let data = self.call("get", &key, self.store.get(&key)).await?;
        TenantIndex::decode(&key, &data)
    }

    /// Replace the tenant index with a single whole-object put
    pub async fn write_tenant_index(&self, index: &TenantIndex) -> Result<()> {
        let key = tenant_index_key(&index.tenant_id);
        let data = index.encode()?;
        self.call("put", &key, self.store.put(&key, data)).await
    }

    /// Remove the tenant index; a missing index is not an error
    pub async fn delete_tenant_index(&self, tenant: &str) -> Result<()> {
        let key = tenant_index_key(tenant);
        self.call("delete", &key, self.store.delete(&key)).await
    }

    pub async fn get_object(&self, tenant: &str, block_id: Uuid, name: &str) -> Result<Bytes> {
        let key = object_key(tenant, block_id, name);
        self.call("get", &key, self.store.get(&key)).await
    }

    pub async fn put_object(
        &self,
        tenant: &str,
        block_id: Uuid,
        name: &str,
        data: Bytes,
    ) -> Result<()> {
        let key = object_key(tenant, block_id, name);
        self.call("put", &key, self.store.put(&key, data)).await
    }
}
