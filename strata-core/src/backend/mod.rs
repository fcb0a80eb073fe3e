//! Object store access
//!
//! The bucket is laid out as:
//!
//! ```text
//! <tenant>/index.json.lz4                    tenant index
//! <tenant>/<blockID>/meta.json               live block meta
//! <tenant>/<blockID>/meta.compacted.json     compacted block meta
//! <tenant>/<blockID>/{index,data,bloom_N}    block contents
//! ```
//!
//! `meta.json` is always written last, which is what makes a block visible.

mod client;
mod local;
mod memory;

pub use client::Backend;
pub use local::LocalStore;
pub use memory::{FaultKind, MemoryStore, StoreCalls};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

/// Name of the live block meta object
pub const META_NAME: &str = "meta.json";

/// Name of the meta object written when a block is compacted
pub const COMPACTED_META_NAME: &str = "meta.compacted.json";

/// Name of the per-tenant index object
pub const TENANT_INDEX_NAME: &str = "index.json.lz4";

/// Name of the block data object
pub const DATA_NAME: &str = "data";

/// Minimal object store capability
///
/// Every call may be slow or fail; callers bound them with timeouts through
/// [`Backend`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// All object keys under `prefix`, recursively
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Immediate child "directories" of `prefix`, without trailing slash
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.list(prefix).await?;
        let mut dirs: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix))
            .filter_map(|rest| rest.split_once('/').map(|(dir, _)| dir.to_string()))
            .collect();
        dirs.sort();
        dirs.dedup();
        Ok(dirs)
    }

    /// Fetch an object, `NotFound` if absent
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Replace an object as a whole
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object, absent objects are not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

pub fn block_prefix(tenant: &str, block_id: Uuid) -> String {
    format!("{}/{}/", tenant, block_id)
}

pub fn object_key(tenant: &str, block_id: Uuid, name: &str) -> String {
    format!("{}/{}/{}", tenant, block_id, name)
}

pub fn meta_key(tenant: &str, block_id: Uuid) -> String {
    object_key(tenant, block_id, META_NAME)
}

pub fn compacted_meta_key(tenant: &str, block_id: Uuid) -> String {
    object_key(tenant, block_id, COMPACTED_META_NAME)
}

pub fn tenant_index_key(tenant: &str) -> String {
    format!("{}/{}", tenant, TENANT_INDEX_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-00000000000a").unwrap();
        assert_eq!(
            meta_key("t1", id),
            "t1/00000000-0000-0000-0000-00000000000a/meta.json"
        );
        assert_eq!(
            compacted_meta_key("t1", id),
            "t1/00000000-0000-0000-0000-00000000000a/meta.compacted.json"
        );
        assert_eq!(tenant_index_key("t1"), "t1/index.json.lz4");
        assert_eq!(
            block_prefix("t1", id),
            "t1/00000000-0000-0000-0000-00000000000a/"
        );
    }

    #[tokio::test]
    async fn test_default_list_dirs() {
        let store = MemoryStore::new();
        store.put("a/1/meta.json", Bytes::from_static(b"{}")).await.unwrap();
        store.put("a/2/meta.json", Bytes::from_static(b"{}")).await.unwrap();
        store.put("a/index.json.lz4", Bytes::from_static(b"x")).await.unwrap();
        store.put("b/1/data", Bytes::from_static(b"x")).await.unwrap();

        let dirs = ObjectStore::list_dirs(&store, "").await.unwrap();
        assert_eq!(dirs, vec!["a".to_string(), "b".to_string()]);

        let dirs = ObjectStore::list_dirs(&store, "a/").await.unwrap();
        assert_eq!(dirs, vec!["1".to_string(), "2".to_string()]);
    }
}
