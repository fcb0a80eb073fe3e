//! Counters and gauges for polling and compaction
//!
//! Plain atomics, read out as serializable snapshots. Rendering into an
//! exposition format is left to the server.

use crate::blocklist::BlocklistSnapshot;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct TenantCounters {
    poll_errors: u64,
    index_errors: u64,
    fallbacks: u64,
    blocklist_length: u64,
    compacted_length: u64,
    live_objects: u64,
    live_bytes: u64,
    compacted_objects: u64,
    compacted_bytes: u64,
    index_age_seconds: Option<u64>,
}

/// Poller instrumentation
#[derive(Debug, Default)]
pub struct PollerMetrics {
    cycles: AtomicU64,
    cycle_errors: AtomicU64,
    last_cycle_millis: AtomicU64,
    index_builds: AtomicU64,
    index_publish_errors: AtomicU64,
    tenants: RwLock<HashMap<String, TenantCounters>>,
}

impl PollerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_millis
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_cycle_error(&self) {
        self.cycle_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_build(&self) {
        self.index_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_publish_error(&self) {
        self.index_publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self, tenant: &str) {
        self.tenants.write().entry(tenant.to_string()).or_default().poll_errors += 1;
    }

    pub fn record_index_error(&self, tenant: &str) {
        self.tenants.write().entry(tenant.to_string()).or_default().index_errors += 1;
    }

    pub fn record_fallback(&self, tenant: &str) {
        self.tenants.write().entry(tenant.to_string()).or_default().fallbacks += 1;
    }

    pub fn record_index_age(&self, tenant: &str, age: Duration) {
        self.tenants
            .write()
            .entry(tenant.to_string())
            .or_default()
            .index_age_seconds = Some(age.as_secs());
    }

    /// Refresh the size gauges from a freshly installed snapshot
    pub fn record_snapshot(&self, snapshot: &BlocklistSnapshot) {
        let totals = snapshot.totals();
        let mut tenants = self.tenants.write();
        let counters = tenants.entry(snapshot.tenant_id.clone()).or_default();
        counters.blocklist_length = snapshot.metas.len() as u64;
        counters.compacted_length = snapshot.compacted_metas.len() as u64;
        counters.live_objects = totals.live_objects;
        counters.live_bytes = totals.live_bytes;
        counters.compacted_objects = totals.compacted_objects;
        counters.compacted_bytes = totals.compacted_bytes;
    }

    /// Forget tenants that left the bucket
    pub fn retain_tenants(&self, keep: impl Fn(&str) -> bool) {
        self.tenants.write().retain(|tenant, _| keep(tenant));
    }

    pub fn snapshot(&self) -> PollerMetricsSnapshot {
        let tenants = self
            .tenants
            .read()
            .iter()
            .map(|(tenant, c)| {
                (
                    tenant.clone(),
                    TenantMetrics {
                        poll_errors: c.poll_errors,
                        index_errors: c.index_errors,
                        fallbacks: c.fallbacks,
                        blocklist_length: c.blocklist_length,
                        compacted_length: c.compacted_length,
                        live_objects: c.live_objects,
                        live_bytes: c.live_bytes,
                        compacted_objects: c.compacted_objects,
                        compacted_bytes: c.compacted_bytes,
                        index_age_seconds: c.index_age_seconds,
                    },
                )
            })
            .collect();

        PollerMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            last_cycle_millis: self.last_cycle_millis.load(Ordering::Relaxed),
            index_builds: self.index_builds.load(Ordering::Relaxed),
            index_publish_errors: self.index_publish_errors.load(Ordering::Relaxed),
            tenants,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantMetrics {
    pub poll_errors: u64,
    pub index_errors: u64,
    pub fallbacks: u64,
    pub blocklist_length: u64,
    pub compacted_length: u64,
    pub live_objects: u64,
    pub live_bytes: u64,
    pub compacted_objects: u64,
    pub compacted_bytes: u64,
    pub index_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerMetricsSnapshot {
    pub cycles: u64,
    pub cycle_errors: u64,
    pub last_cycle_millis: u64,
    pub index_builds: u64,
    pub index_publish_errors: u64,
    /// Sorted by tenant for stable output
    pub tenants: BTreeMap<String, TenantMetrics>,
}

/// Compactor instrumentation
#[derive(Debug, Default)]
pub struct CompactorMetrics {
    compactions: AtomicU64,
    compaction_errors: AtomicU64,
    blocks_compacted: AtomicU64,
    ownership_lost: AtomicU64,
    retention_marked: AtomicU64,
    retention_cleared: AtomicU64,
}

impl CompactorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_compaction(&self, inputs: usize) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.blocks_compacted
            .fetch_add(inputs as u64, Ordering::Relaxed);
    }

    pub fn record_compaction_error(&self) {
        self.compaction_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ownership_lost(&self) {
        self.ownership_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retention(&self, marked: usize, cleared: usize) {
        self.retention_marked
            .fetch_add(marked as u64, Ordering::Relaxed);
        self.retention_cleared
            .fetch_add(cleared as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompactorMetricsSnapshot {
        CompactorMetricsSnapshot {
            compactions: self.compactions.load(Ordering::Relaxed),
            compaction_errors: self.compaction_errors.load(Ordering::Relaxed),
            blocks_compacted: self.blocks_compacted.load(Ordering::Relaxed),
            ownership_lost: self.ownership_lost.load(Ordering::Relaxed),
            retention_marked: self.retention_marked.load(Ordering::Relaxed),
            retention_cleared: self.retention_cleared.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactorMetricsSnapshot {
    pub compactions: u64,
    pub compaction_errors: u64,
    pub blocks_compacted: u64,
    pub ownership_lost: u64,
    pub retention_marked: u64,
    pub retention_cleared: u64,
}
