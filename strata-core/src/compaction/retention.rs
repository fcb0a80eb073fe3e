use super::Compactor;
use crate::blocklist::BlocklistUpdate;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{info, warn};

/// Ring key for a tenant's retention work
pub fn retention_job(tenant: &str) -> String {
    format!("retention-{}", tenant)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub tenants: usize,
    /// Live blocks past `block_retention`, now marked compacted
    pub marked: usize,
    /// Compacted blocks past `compacted_block_retention`, now deleted
    pub cleared: usize,
    pub failed: usize,
}

fn to_chrono(d: Duration) -> ChronoDuration {
    // out of range means "forever"
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::weeks(52 * 1000))
}

impl Compactor {
    /// Retire expired blocks for every tenant this instance owns
    pub async fn retention_once(&self) -> RetentionSummary {
        let mut summary = RetentionSummary::default();
        let now = Utc::now();

        for tenant in self.blocklist.tenants() {
            if !self.sharder.owns(&retention_job(&tenant)) {
                continue;
            }
            summary.tenants += 1;

            let snapshot = self.blocklist.snapshot(&tenant);
            let mut update = BlocklistUpdate::default();

            if !self.config.block_retention.is_zero() {
                let cutoff = now - to_chrono(self.config.block_retention);
                for meta in snapshot.metas.iter().filter(|m| m.end_time < cutoff) {
                    match self
                        .backend
                        .mark_block_compacted(&tenant, meta.block_id, now)
                        .await
                    {
                        Ok(compacted) => {
                            update.remove.push(meta.block_id);
                            update.compacted_add.push(compacted);
                        }
                        Err(e) => {
                            summary.failed += 1;
                            warn!(tenant = %tenant, block = %meta.block_id, error = %e, "failed to mark expired block");
                        }
                    }
                }
            }

            let cutoff = now - to_chrono(self.config.compacted_block_retention);
            for meta in &snapshot.compacted_metas {
                let Some(compacted_at) = meta.compacted_at else {
                    continue;
                };
                if compacted_at >= cutoff {
                    continue;
                }
                match self.backend.clear_block(&tenant, meta.block_id).await {
                    Ok(()) => update.compacted_remove.push(meta.block_id),
                    Err(e) => {
                        summary.failed += 1;
                        warn!(tenant = %tenant, block = %meta.block_id, error = %e, "failed to clear compacted block");
                    }
                }
            }

            let (marked, cleared) = (update.remove.len(), update.compacted_remove.len());
            if marked + cleared > 0 {
                self.blocklist.update(&tenant, update);
                self.metrics.record_retention(marked, cleared);
                info!(tenant = %tenant, marked, cleared, "applied retention");
            }
            summary.marked += marked;
            summary.cleared += cleared;
        }

        summary
    }
}
