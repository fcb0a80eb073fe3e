//! Periodic blocklist polling
//!
//! Each cycle lists the tenants in the bucket and refreshes every tenant's
//! snapshot independently. Builders scan the bucket and publish the tenant
//! index; everyone else reads the index and only lists the bucket when the
//! index is missing, stale, or corrupt and fallback is enabled.

use super::scan::BlockScanner;
use super::state::{PollSuccess, TenantPollStatus};
use super::{Blocklist, BlocklistSnapshot, SnapshotSource};
use crate::backend::Backend;
use crate::config::StorageConfig;
use crate::index::{JobSharder, TenantIndex, TenantIndexBuilder};
use crate::metrics::PollerMetrics;
use crate::{BlockMeta, Result, StrataError};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poller settings, derived from [`StorageConfig`]
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub fallback: bool,
    pub tenant_index_builders: usize,
    pub stale_tenant_index: Option<Duration>,
    pub jitter: Duration,
    pub tolerate_consecutive_errors: usize,
    pub tenant_timeout: Duration,
}

impl From<&StorageConfig> for PollerConfig {
    fn from(config: &StorageConfig) -> Self {
        let mut config = config.clone();
        config.apply_defaults();
        Self {
            poll_interval: config.blocklist_poll,
            concurrency: config.blocklist_poll_concurrency,
            fallback: config.blocklist_poll_fallback,
            tenant_index_builders: config.blocklist_poll_tenant_index_builders,
            stale_tenant_index: config.stale_tenant_index(),
            jitter: Duration::from_millis(config.blocklist_poll_jitter_ms),
            tolerate_consecutive_errors: config.blocklist_poll_tolerate_consecutive_errors,
            tenant_timeout: config.blocklist_poll_tenant_timeout,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub tenants: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tenants currently serving their last good snapshot
    pub degraded: usize,
    pub blocks: usize,
    pub compacted_blocks: usize,
    pub elapsed: Duration,
}

/// Blocks gathered for one tenant, not yet installed
struct TenantPoll {
    source: SnapshotSource,
    success: PollSuccess,
    metas: Vec<BlockMeta>,
    compacted_metas: Vec<BlockMeta>,
}

/// Keeps a [`Blocklist`] in sync with the bucket
pub struct Poller {
    config: PollerConfig,
    backend: Backend,
    blocklist: Arc<Blocklist>,
    scanner: BlockScanner,
    builder: TenantIndexBuilder,
    statuses: RwLock<HashMap<String, TenantPollStatus>>,
    metrics: Arc<PollerMetrics>,
    polled: AtomicBool,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        backend: Backend,
        blocklist: Arc<Blocklist>,
        sharder: Arc<dyn JobSharder>,
    ) -> Self {
        let scanner = BlockScanner::new(backend.clone(), config.concurrency);
        let builder = TenantIndexBuilder::new(
            backend.clone(),
            scanner.clone(),
            sharder,
            config.tenant_index_builders,
        );
        Self {
            config,
            backend,
            blocklist,
            scanner,
            builder,
            statuses: RwLock::new(HashMap::new()),
            metrics: Arc::new(PollerMetrics::new()),
            polled: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn metrics(&self) -> &Arc<PollerMetrics> {
        &self.metrics
    }

    /// Poll state of a tenant, `None` if it has never been polled
    pub fn status(&self, tenant: &str) -> Option<TenantPollStatus> {
        self.statuses.read().get(tenant).cloned()
    }

    pub fn statuses(&self) -> BTreeMap<String, TenantPollStatus> {
        self.statuses
            .read()
            .iter()
            .map(|(tenant, status)| (tenant.clone(), status.clone()))
            .collect()
    }

    /// Whether at least one cycle has been attempted
    pub fn has_polled(&self) -> bool {
        self.polled.load(Ordering::SeqCst)
    }

    /// Run one poll cycle over every tenant in the bucket
    ///
    /// Only a failure to list tenants fails the cycle; tenant failures are
    /// recorded in their status and counted in the summary.
    pub async fn poll_cycle(self: &Arc<Self>) -> Result<CycleSummary> {
        let start = Instant::now();
        self.polled.store(true, Ordering::SeqCst);

        let tenants = match self.backend.tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                self.metrics.record_cycle_error();
                if e.is_permanent() {
                    error!(error = %e, "failed to list tenants, keeping previous blocklist");
                } else {
                    warn!(error = %e, "failed to list tenants, keeping previous blocklist");
                }
                return Err(e);
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for tenant in tenants.iter().cloned() {
            let poller = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                poller.jitter().await;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (tenant, Err(StrataError::Cancelled)),
                };
                let result = poller.poll_tenant(&tenant).await;
                (tenant, result)
            });
        }

        let mut summary = CycleSummary {
            tenants: tenants.len(),
            ..Default::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(snapshot))) => {
                    summary.succeeded += 1;
                    summary.blocks += snapshot.metas.len();
                    summary.compacted_blocks += snapshot.compacted_metas.len();
                }
                Ok((_, Err(_))) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "tenant poll task failed");
                    summary.failed += 1;
                }
            }
        }

        let present: HashSet<String> = tenants.into_iter().collect();
        self.blocklist.retain_tenants(&present);
        self.statuses
            .write()
            .retain(|tenant, _| present.contains(tenant));
        self.metrics.retain_tenants(|tenant| present.contains(tenant));

        summary.degraded = self
            .statuses
            .read()
            .values()
            .filter(|s| s.is_degraded())
            .count();
        summary.elapsed = start.elapsed();
        self.metrics.record_cycle(summary.elapsed);

        info!(
            tenants = summary.tenants,
            failed = summary.failed,
            degraded = summary.degraded,
            blocks = summary.blocks,
            compacted = summary.compacted_blocks,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "blocklist poll complete"
        );

        Ok(summary)
    }

    /// Refresh one tenant's snapshot
    ///
    /// On failure the current snapshot stays in place and the error is
    /// counted against the tenant's tolerance.
    pub async fn poll_tenant(&self, tenant: &str) -> Result<Arc<BlocklistSnapshot>> {
        let previous = self.blocklist.snapshot(tenant);

        let result = match tokio::time::timeout(
            self.config.tenant_timeout,
            self.fetch_tenant(tenant, &previous),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StrataError::Timeout {
                operation: format!("poll tenant {}", tenant),
                millis: self.config.tenant_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(polled) => {
                let snapshot = self.blocklist.swap(
                    tenant,
                    polled.source,
                    polled.metas,
                    polled.compacted_metas,
                );
                self.metrics.record_snapshot(&snapshot);
                self.statuses
                    .write()
                    .entry(tenant.to_string())
                    .or_default()
                    .record_success(polled.success);
                debug!(
                    tenant,
                    generation = snapshot.generation,
                    blocks = snapshot.metas.len(),
                    compacted = snapshot.compacted_metas.len(),
                    "installed blocklist snapshot"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.metrics.record_poll_error(tenant);
                let (degraded, errors) = {
                    let mut statuses = self.statuses.write();
                    let status = statuses.entry(tenant.to_string()).or_default();
                    let degraded =
                        status.record_failure(&e, self.config.tolerate_consecutive_errors);
                    (degraded, status.consecutive_errors)
                };

                if degraded {
                    error!(
                        tenant,
                        consecutive_errors = errors,
                        error = %e,
                        "tenant poll degraded, serving last known blocklist"
                    );
                } else if e.is_permanent() {
                    error!(tenant, consecutive_errors = errors, error = %e, "failed to poll tenant");
                } else {
                    warn!(tenant, consecutive_errors = errors, error = %e, "failed to poll tenant");
                }
                Err(e)
            }
        }
    }

    /// Fetch the tenant index and reject it when it is too old
    pub async fn fetch_index(&self, tenant: &str) -> Result<TenantIndex> {
        let index = self.backend.tenant_index(tenant).await?;
        if index.is_stale(self.config.stale_tenant_index) {
            return Err(StrataError::StaleIndex {
                tenant: tenant.to_string(),
                created_at: index.created_at,
            });
        }
        Ok(index)
    }

    async fn fetch_tenant(&self, tenant: &str, previous: &BlocklistSnapshot) -> Result<TenantPoll> {
        if self.builder.is_builder(tenant) {
            let index = self.builder.build(tenant, previous).await?;
            self.metrics.record_index_build();

            // a failed publish leaves the old index in place; the scan is still good locally
            if let Err(e) = self.builder.publish(&index).await {
                self.metrics.record_index_publish_error();
                self.metrics.record_index_error(tenant);
                if e.is_permanent() {
                    error!(tenant, error = %e, "failed to write tenant index");
                } else {
                    warn!(tenant, error = %e, "failed to write tenant index");
                }
            }
            self.metrics.record_index_age(tenant, Duration::ZERO);

            return Ok(TenantPoll {
                source: SnapshotSource::FullScan,
                success: PollSuccess::Built,
                metas: index.metas,
                compacted_metas: index.compacted_metas,
            });
        }

        let err = match self.fetch_index(tenant).await {
            Ok(index) => {
                let age = index.age();
                self.metrics.record_index_age(tenant, age);
                debug!(
                    tenant,
                    created_at = %index.created_at,
                    blocks = index.metas.len(),
                    compacted = index.compacted_metas.len(),
                    "pulled tenant index"
                );
                return Ok(TenantPoll {
                    source: SnapshotSource::TenantIndex,
                    success: PollSuccess::Index { age },
                    metas: index.metas,
                    compacted_metas: index.compacted_metas,
                });
            }
            Err(e) => e,
        };

        self.metrics.record_index_error(tenant);
        if matches!(err, StrataError::StaleIndex { .. }) {
            self.statuses
                .write()
                .entry(tenant.to_string())
                .or_default()
                .record_stale();
        }

        if !self.config.fallback {
            return Err(err);
        }

        if err.is_decode() || err.is_permanent() {
            error!(tenant, error = %err, "unusable tenant index, falling back to full scan");
        } else {
            warn!(tenant, error = %err, "unusable tenant index, falling back to full scan");
        }
        self.metrics.record_fallback(tenant);

        let scanned = self.scanner.scan(tenant, previous).await?;
        Ok(TenantPoll {
            source: SnapshotSource::FullScan,
            success: PollSuccess::Fallback,
            metas: scanned.metas,
            compacted_metas: scanned.compacted_metas,
        })
    }

    /// Random delay in `[0, jitter)` spreading tenant polls over the cycle
    fn jitter_delay(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }

    async fn jitter(&self) {
        let delay = self.jitter_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Poll on `poll_interval` until cancelled
    ///
    /// The first cycle runs immediately unless one already ran. Cycles that
    /// overrun the interval skip the missed ticks instead of queueing them.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.poll_interval;
        let first = if self.has_polled() {
            tokio::time::Instant::now() + interval
        } else {
            tokio::time::Instant::now()
        };
        let mut ticker = tokio::time::interval_at(first, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "blocklist poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                // failures are already logged and counted
                _ = self.poll_cycle() => {}
            }
        }

        info!("blocklist poller stopped");
    }
}
