//! Core types for Strata

use crate::{Result, StrataError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type used throughout block metadata
pub type Timestamp = DateTime<Utc>;

/// Block encoding format tag
///
/// Formats this build does not know about are kept as `Unknown` so a single
/// block written by a newer release never breaks a tenant's listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockVersion {
    V2,
    VParquet,
    VParquet2,
    VParquet3,
    VParquet4,
    Unknown(String),
}

impl BlockVersion {
    pub fn as_str(&self) -> &str {
        match self {
            BlockVersion::V2 => "v2",
            BlockVersion::VParquet => "vParquet",
            BlockVersion::VParquet2 => "vParquet2",
            BlockVersion::VParquet3 => "vParquet3",
            BlockVersion::VParquet4 => "vParquet4",
            BlockVersion::Unknown(s) => s,
        }
    }

    /// Whether this build knows how to read blocks of this format
    pub fn is_known(&self) -> bool {
        !matches!(self, BlockVersion::Unknown(_))
    }
}

impl Default for BlockVersion {
    fn default() -> Self {
        BlockVersion::VParquet4
    }
}

impl From<String> for BlockVersion {
    fn from(s: String) -> Self {
        match s.as_str() {
            "v2" => BlockVersion::V2,
            "vParquet" => BlockVersion::VParquet,
            "vParquet2" => BlockVersion::VParquet2,
            "vParquet3" => BlockVersion::VParquet3,
            "vParquet4" => BlockVersion::VParquet4,
            _ => BlockVersion::Unknown(s),
        }
    }
}

impl From<BlockVersion> for String {
    fn from(v: BlockVersion) -> Self {
        v.as_str().to_string()
    }
}

impl fmt::Display for BlockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata stored for each immutable block (`meta.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Encoding format of the block
    #[serde(rename = "format", default)]
    pub version: BlockVersion,
    /// Unique identifier of the block within its tenant
    #[serde(rename = "blockID")]
    pub block_id: Uuid,
    /// Tenant the block belongs to
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    /// Roughly when the first object was written to the block
    #[serde(rename = "startTime")]
    pub start_time: Timestamp,
    /// Roughly when the last object was written to the block
    #[serde(rename = "endTime")]
    pub end_time: Timestamp,
    /// Number of objects (traces) in the block
    #[serde(rename = "totalObjects", default)]
    pub total_objects: u64,
    /// Size of the block in bytes
    #[serde(rename = "size", default)]
    pub size_bytes: u64,
    /// Number of times the data in this block has been compacted
    #[serde(rename = "compactionLevel", default)]
    pub compaction_level: u8,
    /// Set once the block has been superseded by compaction
    #[serde(
        rename = "compactedTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compacted_at: Option<Timestamp>,
}

impl BlockMeta {
    /// Create a level 0 meta covering a single instant
    pub fn new(tenant_id: impl Into<String>, block_id: Uuid, version: BlockVersion) -> Self {
        let now = Utc::now();
        Self {
            version,
            block_id,
            tenant_id: tenant_id.into(),
            start_time: now,
            end_time: now,
            total_objects: 0,
            size_bytes: 0,
            compaction_level: 0,
            compacted_at: None,
        }
    }

    pub fn with_time_range(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_objects(mut self, total_objects: u64, size_bytes: u64) -> Self {
        self.total_objects = total_objects;
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.compaction_level = level;
        self
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted_at.is_some()
    }

    /// Unknown formats are carried in the blocklist but never searched
    pub fn is_readable(&self) -> bool {
        self.version.is_known()
    }

    /// A copy of this meta marked as superseded at `at`
    pub fn compacted(&self, at: Timestamp) -> Self {
        Self {
            compacted_at: Some(at),
            ..self.clone()
        }
    }

    /// Check if the block may contain data in the time range
    pub fn overlaps_time(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start_time <= end && self.end_time >= start
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_time > self.end_time {
            return Err(StrataError::decode(
                format!("{}/{}", self.tenant_id, self.block_id),
                format!(
                    "start time {} is after end time {}",
                    self.start_time, self.end_time
                ),
            ));
        }
        Ok(())
    }

    /// Build the meta of the block produced by compacting `inputs`
    pub fn merged(inputs: &[BlockMeta]) -> Result<BlockMeta> {
        let first = inputs
            .first()
            .ok_or_else(|| StrataError::Internal("cannot merge zero blocks".to_string()))?;

        let newest = inputs
            .iter()
            .max_by_key(|m| m.end_time)
            .unwrap_or(first);

        let mut out = BlockMeta {
            version: newest.version.clone(),
            block_id: Uuid::new_v4(),
            tenant_id: first.tenant_id.clone(),
            start_time: first.start_time,
            end_time: first.end_time,
            total_objects: 0,
            size_bytes: 0,
            compaction_level: 0,
            compacted_at: None,
        };

        for meta in inputs {
            out.start_time = out.start_time.min(meta.start_time);
            out.end_time = out.end_time.max(meta.end_time);
            out.total_objects += meta.total_objects;
            out.size_bytes += meta.size_bytes;
            out.compaction_level = out.compaction_level.max(meta.compaction_level);
        }
        out.compaction_level = out.compaction_level.saturating_add(1);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_block_meta_json_layout() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let meta = BlockMeta::new("t1", id, BlockVersion::VParquet3).with_objects(10, 2048);
        let json = serde_json::to_value(&meta).unwrap();

        assert_eq!(json["format"], "vParquet3");
        assert_eq!(json["blockID"], "00000000-0000-0000-0000-000000000001");
        assert_eq!(json["tenantID"], "t1");
        assert_eq!(json["totalObjects"], 10);
        assert_eq!(json["size"], 2048);
        assert!(json.get("compactedTime").is_none());
    }

    #[test]
    fn test_unknown_version_is_opaque() {
        let raw = r#"{
            "format": "vParquet9",
            "blockID": "00000000-0000-0000-0000-000000000002",
            "tenantID": "t1",
            "startTime": "2024-01-01T00:00:00Z",
            "endTime": "2024-01-01T01:00:00Z"
        }"#;
        let meta: BlockMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.version, BlockVersion::Unknown("vParquet9".into()));
        assert!(!meta.is_readable());
        assert_eq!(meta.compaction_level, 0);

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["format"], "vParquet9");
    }

    #[test]
    fn test_validate_time_range() {
        let now = Utc::now();
        let meta = BlockMeta::new("t1", Uuid::new_v4(), BlockVersion::default())
            .with_time_range(now, now - Duration::seconds(1));
        assert!(meta.validate().unwrap_err().is_decode());
    }

    #[test]
    fn test_merged() {
        let now = Utc::now();
        let a = BlockMeta::new("t1", Uuid::new_v4(), BlockVersion::VParquet3)
            .with_time_range(now - Duration::hours(2), now - Duration::hours(1))
            .with_objects(5, 100);
        let b = BlockMeta::new("t1", Uuid::new_v4(), BlockVersion::VParquet4)
            .with_time_range(now - Duration::hours(3), now)
            .with_objects(7, 300)
            .with_level(1);

        let c = BlockMeta::merged(&[a.clone(), b.clone()]).unwrap();
        assert_ne!(c.block_id, a.block_id);
        assert_ne!(c.block_id, b.block_id);
        assert_eq!(c.compaction_level, 2);
        assert_eq!(c.total_objects, 12);
        assert_eq!(c.size_bytes, 400);
        assert_eq!(c.start_time, b.start_time);
        assert_eq!(c.end_time, b.end_time);
        assert_eq!(c.version, BlockVersion::VParquet4);
        assert!(!c.is_compacted());

        assert!(BlockMeta::merged(&[]).is_err());
    }
}
