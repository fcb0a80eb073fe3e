//! Time-window block selection

use crate::blocklist::BlocklistSnapshot;
use crate::config::CompactorConfig;
use crate::{BlockMeta, Timestamp};
use chrono::DateTime;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// A set of blocks to merge into one
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionJob {
    pub tenant: String,
    pub level: u8,
    pub window_start: Timestamp,
    pub blocks: Vec<BlockMeta>,
}

impl CompactionJob {
    /// Ring key, shared by every job of the same tenant, level and window
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.tenant,
            self.level,
            self.window_start.timestamp()
        )
    }

    pub fn block_ids(&self) -> Vec<Uuid> {
        self.blocks.iter().map(|m| m.block_id).collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.blocks.iter().map(|m| m.size_bytes).sum()
    }
}

/// Groups blocks by end-time window and compaction level
#[derive(Debug, Clone)]
pub struct BlockSelector {
    window: Duration,
    min_input_blocks: usize,
    max_input_blocks: usize,
    max_block_bytes: u64,
}

impl BlockSelector {
    pub fn new(config: &CompactorConfig) -> Self {
        Self {
            window: config.compaction_window,
            min_input_blocks: config.min_input_blocks.max(2),
            max_input_blocks: config.max_input_blocks.max(config.min_input_blocks.max(2)),
            max_block_bytes: config.max_block_bytes,
        }
    }

    fn window_start(&self, at: Timestamp) -> Option<Timestamp> {
        let window = self.window.as_secs().max(1) as i64;
        let start = at.timestamp().div_euclid(window) * window;
        DateTime::from_timestamp(start, 0)
    }

    /// Jobs for a tenant's snapshot, oldest window first
    ///
    /// Only live blocks in a known format are considered. Within a group the
    /// smallest blocks are merged first; a group may yield several jobs.
    pub fn select(&self, snapshot: &BlocklistSnapshot) -> Vec<CompactionJob> {
        let mut groups: BTreeMap<(Timestamp, u8), Vec<&BlockMeta>> = BTreeMap::new();
        for meta in &snapshot.metas {
            if meta.is_compacted() || !meta.is_readable() {
                continue;
            }
            let Some(window) = self.window_start(meta.end_time) else {
                continue;
            };
            groups
                .entry((window, meta.compaction_level))
                .or_default()
                .push(meta);
        }

        let mut jobs = Vec::new();
        for ((window_start, level), mut blocks) in groups {
            if blocks.len() < self.min_input_blocks {
                continue;
            }
            blocks.sort_by(|a, b| {
                a.total_objects
                    .cmp(&b.total_objects)
                    .then_with(|| a.block_id.cmp(&b.block_id))
            });

            let mut remaining = blocks.as_slice();
            while remaining.len() >= self.min_input_blocks {
                let mut picked: Vec<BlockMeta> = Vec::new();
                let mut bytes = 0u64;
                for meta in remaining {
                    if picked.len() == self.max_input_blocks {
                        break;
                    }
                    if !picked.is_empty() && bytes + meta.size_bytes > self.max_block_bytes {
                        break;
                    }
                    bytes += meta.size_bytes;
                    picked.push((*meta).clone());
                }

                // the smallest remaining blocks already exceed the size cap
                if picked.len() < self.min_input_blocks {
                    break;
                }

                remaining = &remaining[picked.len()..];
                jobs.push(CompactionJob {
                    tenant: snapshot.tenant_id.clone(),
                    level,
                    window_start,
                    blocks: picked,
                });
            }
        }
        jobs
    }
}
