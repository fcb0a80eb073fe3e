//! Per-tenant index of block metas
//!
//! The index is a derived, disposable summary of a tenant's blocks. It can be
//! deleted at any time and rebuilt from a full listing; it only exists so
//! pollers do not have to list the bucket on every cycle.

mod builder;

pub use builder::{
    builder_job, JobSharder, OwnsEverythingSharder, OwnsNothingSharder, TenantIndexBuilder,
};

use crate::{BlockMeta, Result, StrataError, Timestamp};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Upper bound on a decoded index, guards against corrupt size headers
const MAX_INDEX_BYTES: usize = 512 * 1024 * 1024;

/// Serialized summary of a tenant's live and compacted blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantIndex {
    #[serde(rename = "tenant", default)]
    pub tenant_id: String,
    pub created_at: Timestamp,
    #[serde(rename = "meta", default)]
    pub metas: Vec<BlockMeta>,
    #[serde(rename = "compacted", default)]
    pub compacted_metas: Vec<BlockMeta>,
}

impl TenantIndex {
    /// Build an index in canonical form
    pub fn new(
        tenant_id: impl Into<String>,
        created_at: Timestamp,
        metas: Vec<BlockMeta>,
        compacted_metas: Vec<BlockMeta>,
    ) -> Self {
        let mut index = Self {
            tenant_id: tenant_id.into(),
            created_at,
            metas,
            compacted_metas,
        };
        index.normalize();
        index
    }

    /// Sort both lists and drop live entries that are also compacted
    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.compacted_metas.retain(|m| seen.insert(m.block_id));
        // compacted ids are already in `seen`, so this also enforces disjointness
        self.metas.retain(|m| seen.insert(m.block_id));

        sort_metas(&mut self.metas);
        sort_metas(&mut self.compacted_metas);
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty() && self.compacted_metas.is_empty()
    }

    /// Drop entries a reader could not trust
    ///
    /// A bad entry only costs that one block; the rest of the index is kept.
    fn drop_invalid(&mut self, key: &str) {
        let tenant = self.tenant_id.clone();
        let valid = |m: &BlockMeta, compacted: bool| {
            let reason = if m.tenant_id != tenant {
                Some(format!("belongs to tenant {}", m.tenant_id))
            } else if compacted && m.compacted_at.is_none() {
                Some("missing compactedTime".to_string())
            } else {
                m.validate().err().map(|e| e.to_string())
            };
            match reason {
                Some(reason) => {
                    warn!(key, block = %m.block_id, compacted, %reason, "skipping invalid index entry");
                    false
                }
                None => true,
            }
        };
        self.metas.retain(|m| valid(m, false));
        self.compacted_metas.retain(|m| valid(m, true));
    }

    /// Age of the index relative to now, zero if created in the future
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the index is older than `threshold`
    pub fn is_stale(&self, threshold: Option<Duration>) -> bool {
        match threshold {
            Some(threshold) => self.age() > threshold,
            None => false,
        }
    }

    /// JSON, lz4 compressed with the uncompressed size prepended
    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self).map_err(|e| StrataError::Internal(e.to_string()))?;
        Ok(Bytes::from(lz4_flex::compress_prepend_size(&json)))
    }

    pub fn decode(key: &str, data: &[u8]) -> Result<Self> {
        let size = data
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| StrataError::decode(key, "truncated index"))?;
        if size > MAX_INDEX_BYTES {
            return Err(StrataError::decode(
                key,
                format!("uncompressed size {} exceeds {}", size, MAX_INDEX_BYTES),
            ));
        }

        let json = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| StrataError::decode(key, e))?;
        let mut index: TenantIndex =
            serde_json::from_slice(&json).map_err(|e| StrataError::decode(key, e))?;
        index.drop_invalid(key);
        index.normalize();
        Ok(index)
    }
}

/// Order used everywhere a block list is materialized
pub(crate) fn sort_metas(metas: &mut [BlockMeta]) {
    metas.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.block_id.cmp(&b.block_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockVersion;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn meta(id: u128, start_offset_secs: i64) -> BlockMeta {
        let start = Utc::now() - ChronoDuration::seconds(start_offset_secs);
        BlockMeta::new("t1", Uuid::from_u128(id), BlockVersion::VParquet4)
            .with_time_range(start, start + ChronoDuration::seconds(10))
    }

    #[test]
    fn test_encode_decode() {
        let now = Utc::now();
        let index = TenantIndex::new(
            "t1",
            now,
            vec![meta(1, 100), meta(2, 50)],
            vec![meta(3, 200).compacted(now)],
        );

        let data = index.encode().unwrap();
        let decoded = TenantIndex::decode("t1/index.json.lz4", &data).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_canonical_order_is_input_independent() {
        let now = Utc::now();
        let (a, b, c) = (meta(1, 30), meta(2, 20), meta(3, 10));

        let first = TenantIndex::new("t1", now, vec![a.clone(), b.clone(), c.clone()], vec![]);
        let second = TenantIndex::new("t1", now, vec![c, a, b], vec![]);

        assert_eq!(first.encode().unwrap(), second.encode().unwrap());
    }

    #[test]
    fn test_live_and_compacted_disjoint() {
        let now = Utc::now();
        let a = meta(1, 30);
        let index = TenantIndex::new(
            "t1",
            now,
            vec![a.clone(), meta(2, 20)],
            vec![a.compacted(now)],
        );

        assert_eq!(index.metas.len(), 1);
        assert_eq!(index.metas[0].block_id, Uuid::from_u128(2));
        assert_eq!(index.compacted_metas.len(), 1);
        let live: HashSet<_> = index.metas.iter().map(|m| m.block_id).collect();
        assert!(index.compacted_metas.iter().all(|m| !live.contains(&m.block_id)));
    }

    #[test]
    fn test_corrupt_payload() {
        let err = TenantIndex::decode("t1/index.json.lz4", b"\x05\x00\x00\x00\xff").unwrap_err();
        assert!(err.is_decode());

        let err = TenantIndex::decode("t1/index.json.lz4", b"ab").unwrap_err();
        assert!(err.is_decode());

        let err = TenantIndex::decode("t1/index.json.lz4", b"\xff\xff\xff\xffxx").unwrap_err();
        assert!(err.is_decode());

        let not_json = lz4_flex::compress_prepend_size(b"[1,2");
        let err = TenantIndex::decode("t1/index.json.lz4", &not_json).unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let now = Utc::now();
        let good = meta(1, 100);
        let mut backwards = meta(2, 50);
        backwards.end_time = backwards.start_time - ChronoDuration::seconds(1);
        let foreign = BlockMeta::new("t2", Uuid::from_u128(3), BlockVersion::VParquet4);
        let uncompacted = meta(4, 200);
        let compacted = meta(5, 300).compacted(now);

        let raw = TenantIndex {
            tenant_id: "t1".to_string(),
            created_at: now,
            metas: vec![good.clone(), backwards, foreign],
            compacted_metas: vec![uncompacted, compacted.clone()],
        };
        let json = serde_json::to_vec(&raw).unwrap();
        let data = lz4_flex::compress_prepend_size(&json);

        let decoded = TenantIndex::decode("t1/index.json.lz4", &data).unwrap();
        assert_eq!(decoded.metas, vec![good]);
        assert_eq!(decoded.compacted_metas, vec![compacted]);
    }

    #[test]
    fn test_staleness() {
        let old = TenantIndex::new("t1", Utc::now() - ChronoDuration::minutes(20), vec![], vec![]);
        assert!(old.is_stale(Some(Duration::from_secs(600))));
        assert!(!old.is_stale(Some(Duration::from_secs(3600))));
        assert!(!old.is_stale(None));
    }
}
