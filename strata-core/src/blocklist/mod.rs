//! In-memory blocklist
//!
//! Every component keeps its own view of which blocks exist, one immutable
//! [`BlocklistSnapshot`] per tenant. A poll never patches a snapshot: it
//! builds a new generation and swaps the `Arc`, so readers always see either
//! the old or the new set in full.

mod poller;
mod scan;
mod state;

pub use poller::{CycleSummary, Poller, PollerConfig};
pub use scan::{BlockScanner, ScanResult};
pub use state::{PollState, PollSuccess, TenantPollStatus};

use crate::index::sort_metas;
use crate::{BlockMeta, Timestamp};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Where a snapshot's contents came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Nothing polled yet
    Empty,
    /// Fetched tenant index
    TenantIndex,
    /// Full bucket listing
    FullScan,
    /// Local change applied after a compaction or retention pass
    LocalUpdate,
}

/// Immutable point-in-time view of one tenant's blocks
#[derive(Debug, Clone, Serialize)]
pub struct BlocklistSnapshot {
    pub tenant_id: String,
    pub generation: u64,
    pub polled_at: Timestamp,
    pub source: SnapshotSource,
    pub metas: Vec<BlockMeta>,
    pub compacted_metas: Vec<BlockMeta>,
}

impl BlocklistSnapshot {
    pub fn empty(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            generation: 0,
            polled_at: Utc::now(),
            source: SnapshotSource::Empty,
            metas: Vec::new(),
            compacted_metas: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty() && self.compacted_metas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn contains(&self, block_id: Uuid) -> bool {
        self.metas.iter().any(|m| m.block_id == block_id)
    }

    pub fn find(&self, block_id: Uuid) -> Option<&BlockMeta> {
        self.metas
            .iter()
            .chain(self.compacted_metas.iter())
            .find(|m| m.block_id == block_id)
    }

    /// Blocks a reader should search for data in `[start, end]`
    ///
    /// Includes compacted blocks superseded within `lookback`, since other
    /// components may still be serving a view in which they are live.
    pub fn blocks_for_range(
        &self,
        start: Timestamp,
        end: Timestamp,
        lookback: Duration,
    ) -> Vec<&BlockMeta> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::zero());

        let live = self
            .metas
            .iter()
            .filter(|m| m.is_readable() && m.overlaps_time(start, end));

        let recently_compacted = self.compacted_metas.iter().filter(|m| {
            m.is_readable()
                && m.compacted_at.map_or(false, |at| at >= cutoff)
                && m.overlaps_time(start, end)
        });

        live.chain(recently_compacted).collect()
    }

    pub fn totals(&self) -> BlocklistTotals {
        let mut totals = BlocklistTotals::default();
        for m in &self.metas {
            totals.live_objects += m.total_objects;
            totals.live_bytes += m.size_bytes;
        }
        for m in &self.compacted_metas {
            totals.compacted_objects += m.total_objects;
            totals.compacted_bytes += m.size_bytes;
        }
        totals
    }
}

/// Object and byte counts of a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlocklistTotals {
    pub live_objects: u64,
    pub live_bytes: u64,
    pub compacted_objects: u64,
    pub compacted_bytes: u64,
}

/// Local change to a tenant's blocklist
#[derive(Debug, Clone, Default)]
pub struct BlocklistUpdate {
    pub add: Vec<BlockMeta>,
    pub remove: Vec<Uuid>,
    pub compacted_add: Vec<BlockMeta>,
    pub compacted_remove: Vec<Uuid>,
}

impl BlocklistUpdate {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.remove.is_empty()
            && self.compacted_add.is_empty()
            && self.compacted_remove.is_empty()
    }

    /// Apply onto a pair of block lists, leaving them unsorted
    fn apply_to(&self, metas: &mut Vec<BlockMeta>, compacted: &mut Vec<BlockMeta>) {
        let removed: HashSet<Uuid> = self.remove.iter().copied().collect();
        let compacted_removed: HashSet<Uuid> = self.compacted_remove.iter().copied().collect();
        let compacted_added: HashSet<Uuid> =
            self.compacted_add.iter().map(|m| m.block_id).collect();

        metas.retain(|m| !removed.contains(&m.block_id) && !compacted_added.contains(&m.block_id));
        for meta in &self.add {
            if !metas.iter().any(|m| m.block_id == meta.block_id) {
                metas.push(meta.clone());
            }
        }

        compacted.retain(|m| !compacted_removed.contains(&m.block_id));
        for meta in &self.compacted_add {
            if !compacted.iter().any(|m| m.block_id == meta.block_id) {
                compacted.push(meta.clone());
            }
        }
    }

    /// Keep only the parts a polled view does not already reflect
    fn unresolved(&self, live: &HashSet<Uuid>, compacted: &HashSet<Uuid>) -> Self {
        Self {
            add: self
                .add
                .iter()
                .filter(|m| !live.contains(&m.block_id) && !compacted.contains(&m.block_id))
                .cloned()
                .collect(),
            remove: self
                .remove
                .iter()
                .filter(|id| live.contains(id))
                .copied()
                .collect(),
            compacted_add: self
                .compacted_add
                .iter()
                .filter(|m| !compacted.contains(&m.block_id))
                .cloned()
                .collect(),
            compacted_remove: self
                .compacted_remove
                .iter()
                .filter(|id| compacted.contains(id))
                .copied()
                .collect(),
        }
    }
}

/// How long a local change is re-applied over polls that do not show it
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct PendingUpdate {
    update: BlocklistUpdate,
    recorded_at: Instant,
}

/// Per-tenant snapshots shared between the poller and readers
///
/// Local updates are remembered until a poll reflects them. A poll that
/// started before the update would otherwise swap the old view back in.
pub struct Blocklist {
    tenants: RwLock<HashMap<String, Arc<BlocklistSnapshot>>>,
    // always locked after `tenants`
    pending: Mutex<HashMap<String, Vec<PendingUpdate>>>,
    pending_ttl: Duration,
    next_generation: AtomicU64,
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocklist {
    pub fn new() -> Self {
        Self::with_pending_ttl(DEFAULT_PENDING_TTL)
    }

    pub fn with_pending_ttl(pending_ttl: Duration) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_ttl,
            next_generation: AtomicU64::new(1),
        }
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Current snapshot for a tenant; never blocks on the network
    pub fn snapshot(&self, tenant: &str) -> Arc<BlocklistSnapshot> {
        self.tenants
            .read()
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| Arc::new(BlocklistSnapshot::empty(tenant)))
    }

    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<_> = self.tenants.read().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    pub fn metas(&self, tenant: &str) -> Vec<BlockMeta> {
        self.snapshot(tenant).metas.clone()
    }

    pub fn compacted_metas(&self, tenant: &str) -> Vec<BlockMeta> {
        self.snapshot(tenant).compacted_metas.clone()
    }

    /// Local updates not yet seen in a poll
    pub fn pending_updates(&self, tenant: &str) -> usize {
        self.pending.lock().get(tenant).map_or(0, Vec::len)
    }

    /// Install a polled generation for a tenant
    ///
    /// Pending local updates the polled lists do not reflect yet are applied
    /// on top. Reflected or expired ones are forgotten.
    pub fn swap(
        &self,
        tenant: &str,
        source: SnapshotSource,
        mut metas: Vec<BlockMeta>,
        mut compacted_metas: Vec<BlockMeta>,
    ) -> Arc<BlocklistSnapshot> {
        let mut tenants = self.tenants.write();
        let mut pending = self.pending.lock();

        let mut settled = false;
        if let Some(updates) = pending.get_mut(tenant) {
            let live: HashSet<Uuid> = metas.iter().map(|m| m.block_id).collect();
            let compacted: HashSet<Uuid> = compacted_metas.iter().map(|m| m.block_id).collect();

            let ttl = self.pending_ttl;
            updates.retain_mut(|p| {
                if p.recorded_at.elapsed() >= ttl {
                    return false;
                }
                p.update = p.update.unresolved(&live, &compacted);
                !p.update.is_empty()
            });
            for p in updates.iter() {
                p.update.apply_to(&mut metas, &mut compacted_metas);
            }
            settled = updates.is_empty();
        }
        if settled {
            pending.remove(tenant);
        }

        sort_metas(&mut metas);
        sort_metas(&mut compacted_metas);

        let snapshot = Arc::new(BlocklistSnapshot {
            tenant_id: tenant.to_string(),
            generation: self.generation(),
            polled_at: Utc::now(),
            source,
            metas,
            compacted_metas,
        });
        tenants.insert(tenant.to_string(), snapshot.clone());
        snapshot
    }

    /// Drop tenants that no longer exist in the bucket
    pub fn retain_tenants(&self, present: &HashSet<String>) {
        let mut tenants = self.tenants.write();
        tenants.retain(|tenant, _| present.contains(tenant));
        self.pending.lock().retain(|tenant, _| present.contains(tenant));
    }

    /// Apply a local change as a new generation
    ///
    /// The current snapshot is read and replaced under one write lock so a
    /// concurrent swap cannot interleave with the update. The change is also
    /// kept and re-applied by later swaps until a poll shows it.
    pub fn update(&self, tenant: &str, update: BlocklistUpdate) -> Arc<BlocklistSnapshot> {
        let mut tenants = self.tenants.write();
        let current = tenants
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| Arc::new(BlocklistSnapshot::empty(tenant)));

        let mut metas = current.metas.clone();
        let mut compacted = current.compacted_metas.clone();
        update.apply_to(&mut metas, &mut compacted);
        sort_metas(&mut metas);
        sort_metas(&mut compacted);

        if !update.is_empty() {
            self.pending
                .lock()
                .entry(tenant.to_string())
                .or_default()
                .push(PendingUpdate {
                    update,
                    recorded_at: Instant::now(),
                });
        }

        let snapshot = Arc::new(BlocklistSnapshot {
            tenant_id: tenant.to_string(),
            generation: self.generation(),
            polled_at: current.polled_at,
            source: SnapshotSource::LocalUpdate,
            metas,
            compacted_metas: compacted,
        });
        tenants.insert(tenant.to_string(), snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockVersion;
    use std::collections::BTreeSet;
    use std::thread;

    fn meta(id: u128) -> BlockMeta {
        BlockMeta::new("test", Uuid::from_u128(id), BlockVersion::default())
    }

    fn ids(metas: &[BlockMeta]) -> BTreeSet<u128> {
        metas.iter().map(|m| m.block_id.as_u128()).collect()
    }

    #[test]
    fn test_unknown_tenant_is_empty() {
        let blocklist = Blocklist::new();
        let snapshot = blocklist.snapshot("nobody");
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation, 0);
        assert_eq!(snapshot.source, SnapshotSource::Empty);
    }

    #[test]
    fn test_update() {
        struct Case {
            name: &'static str,
            existing: Vec<u128>,
            add: Vec<u128>,
            remove: Vec<u128>,
            expected: Vec<u128>,
        }

        let cases = vec![
            Case { name: "all empty", existing: vec![], add: vec![], remove: vec![], expected: vec![] },
            Case { name: "add to empty", existing: vec![], add: vec![1], remove: vec![], expected: vec![1] },
            Case { name: "add to existing", existing: vec![1], add: vec![2], remove: vec![], expected: vec![1, 2] },
            Case { name: "remove from empty", existing: vec![], add: vec![], remove: vec![2], expected: vec![] },
            Case { name: "remove existing", existing: vec![1, 2], add: vec![], remove: vec![1], expected: vec![2] },
            Case { name: "remove no match", existing: vec![1], add: vec![], remove: vec![2], expected: vec![1] },
            Case { name: "add and remove", existing: vec![1, 2], add: vec![3], remove: vec![2], expected: vec![1, 3] },
            Case { name: "add duplicate", existing: vec![1], add: vec![1], remove: vec![], expected: vec![1] },
        ];

        for case in cases {
            let blocklist = Blocklist::new();
            blocklist.swap(
                "test",
                SnapshotSource::FullScan,
                case.existing.iter().map(|&i| meta(i)).collect(),
                vec![],
            );
            let before = blocklist.snapshot("test");

            let after = blocklist.update(
                "test",
                BlocklistUpdate {
                    add: case.add.iter().map(|&i| meta(i)).collect(),
                    remove: case.remove.iter().map(|&i| Uuid::from_u128(i)).collect(),
                    ..Default::default()
                },
            );

            assert_eq!(
                ids(&after.metas),
                case.expected.iter().copied().collect::<BTreeSet<_>>(),
                "{}",
                case.name
            );
            // the previous generation is untouched
            assert_eq!(
                ids(&before.metas),
                case.existing.iter().copied().collect::<BTreeSet<_>>(),
                "{}",
                case.name
            );
            assert!(after.generation > before.generation, "{}", case.name);
        }
    }

    #[test]
    fn test_update_compacted_moves_block() {
        let blocklist = Blocklist::new();
        blocklist.swap("test", SnapshotSource::TenantIndex, vec![meta(1), meta(2)], vec![]);

        let now = Utc::now();
        let after = blocklist.update(
            "test",
            BlocklistUpdate {
                add: vec![meta(3)],
                compacted_add: vec![meta(1).compacted(now), meta(2).compacted(now)],
                ..Default::default()
            },
        );

        assert_eq!(ids(&after.metas), BTreeSet::from([3]));
        assert_eq!(ids(&after.compacted_metas), BTreeSet::from([1, 2]));
        assert_eq!(after.source, SnapshotSource::LocalUpdate);

        let after = blocklist.update(
            "test",
            BlocklistUpdate {
                compacted_remove: vec![Uuid::from_u128(1)],
                ..Default::default()
            },
        );
        assert_eq!(ids(&after.compacted_metas), BTreeSet::from([2]));
    }

    #[test]
    fn test_swap_reapplies_unseen_update() {
        let blocklist = Blocklist::new();
        blocklist.swap("test", SnapshotSource::TenantIndex, vec![meta(1), meta(2)], vec![]);

        let now = Utc::now();
        let compaction = BlocklistUpdate {
            add: vec![meta(3)],
            remove: vec![Uuid::from_u128(1), Uuid::from_u128(2)],
            compacted_add: vec![meta(1).compacted(now), meta(2).compacted(now)],
            ..Default::default()
        };
        blocklist.update("test", compaction);

        // index built before the compaction
        let after = blocklist.swap("test", SnapshotSource::TenantIndex, vec![meta(1), meta(2)], vec![]);
        assert_eq!(ids(&after.metas), BTreeSet::from([3]));
        assert_eq!(ids(&after.compacted_metas), BTreeSet::from([1, 2]));
        assert_eq!(after.source, SnapshotSource::TenantIndex);
        assert_eq!(blocklist.pending_updates("test"), 1);

        // index that shows the output but still lists one input as live
        let after = blocklist.swap(
            "test",
            SnapshotSource::TenantIndex,
            vec![meta(2), meta(3)],
            vec![meta(1).compacted(now)],
        );
        assert_eq!(ids(&after.metas), BTreeSet::from([3]));
        assert_eq!(ids(&after.compacted_metas), BTreeSet::from([1, 2]));
        assert_eq!(blocklist.pending_updates("test"), 1);

        // fully reflected, nothing left to re-apply
        blocklist.swap(
            "test",
            SnapshotSource::TenantIndex,
            vec![meta(3)],
            vec![meta(1).compacted(now), meta(2).compacted(now)],
        );
        assert_eq!(blocklist.pending_updates("test"), 0);

        // a later poll is taken as is
        let after = blocklist.swap("test", SnapshotSource::FullScan, vec![meta(3), meta(4)], vec![]);
        assert_eq!(ids(&after.metas), BTreeSet::from([3, 4]));
        assert!(after.compacted_metas.is_empty());
    }

    #[test]
    fn test_pending_update_expires() {
        let blocklist = Blocklist::with_pending_ttl(Duration::ZERO);
        blocklist.swap("test", SnapshotSource::TenantIndex, vec![meta(1)], vec![]);
        blocklist.update(
            "test",
            BlocklistUpdate {
                remove: vec![Uuid::from_u128(1)],
                ..Default::default()
            },
        );

        let after = blocklist.swap("test", SnapshotSource::TenantIndex, vec![meta(1)], vec![]);
        assert_eq!(ids(&after.metas), BTreeSet::from([1]));
        assert_eq!(blocklist.pending_updates("test"), 0);
    }

    #[test]
    fn test_retain_tenants_drops_pending() {
        let blocklist = Blocklist::new();
        blocklist.update(
            "gone",
            BlocklistUpdate {
                add: vec![meta(1)],
                ..Default::default()
            },
        );
        blocklist.update("kept", BlocklistUpdate { add: vec![meta(2)], ..Default::default() });

        blocklist.retain_tenants(&HashSet::from(["kept".to_string()]));
        assert_eq!(blocklist.tenants(), vec!["kept".to_string()]);
        assert_eq!(blocklist.pending_updates("gone"), 0);
        assert_eq!(blocklist.pending_updates("kept"), 1);
    }

    #[test]
    fn test_blocks_for_range() {
        let now = Utc::now();
        let hour = chrono::Duration::hours(1);

        let old = meta(1).with_time_range(now - hour * 5, now - hour * 4);
        let current = meta(2).with_time_range(now - hour, now);
        let mut unreadable = meta(3).with_time_range(now - hour, now);
        unreadable.version = BlockVersion::Unknown("v99".into());
        let just_compacted = meta(4).with_time_range(now - hour, now).compacted(now);
        let long_compacted = meta(5)
            .with_time_range(now - hour, now)
            .compacted(now - hour * 2);

        let blocklist = Blocklist::new();
        let snapshot = blocklist.swap(
            "test",
            SnapshotSource::FullScan,
            vec![old, current, unreadable],
            vec![just_compacted, long_compacted],
        );

        let found: BTreeSet<u128> = snapshot
            .blocks_for_range(now - hour * 2, now, Duration::from_secs(600))
            .iter()
            .map(|m| m.block_id.as_u128())
            .collect();
        assert_eq!(found, BTreeSet::from([2, 4]));
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let blocklist = Arc::new(Blocklist::new());
        let set_a: Vec<BlockMeta> = (0..50).map(meta).collect();
        let set_b: Vec<BlockMeta> = (100..180).map(meta).collect();
        let ids_a = ids(&set_a);
        let ids_b = ids(&set_b);
        blocklist.swap("test", SnapshotSource::FullScan, set_a.clone(), vec![]);

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let blocklist = blocklist.clone();
                let (ids_a, ids_b) = (ids_a.clone(), ids_b.clone());
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let seen = ids(&blocklist.snapshot("test").metas);
                        assert!(seen == ids_a || seen == ids_b, "observed a partial snapshot");
                    }
                })
            })
            .collect();

        for i in 0..500 {
            let next = if i % 2 == 0 { set_b.clone() } else { set_a.clone() };
            blocklist.swap("test", SnapshotSource::FullScan, next, vec![]);
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
