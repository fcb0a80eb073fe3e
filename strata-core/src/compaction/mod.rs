//! Block compaction and retention
//!
//! Jobs are sharded over the ring by their window key. A job writes its
//! output block under a fresh ID, checks it still owns the job, then makes
//! the output visible by writing its meta and retires the inputs. An
//! instance that loses ownership mid-job, or finds an input already retired
//! by someone else, abandons the output; nothing ever references it.

mod retention;
mod selector;

pub use retention::{retention_job, RetentionSummary};
pub use selector::{BlockSelector, CompactionJob};

use crate::backend::{Backend, DATA_NAME};
use crate::blocklist::{Blocklist, BlocklistUpdate};
use crate::config::CompactorConfig;
use crate::index::JobSharder;
use crate::metrics::CompactorMetrics;
use crate::{BlockMeta, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Writes the data objects of a compacted block
#[async_trait]
pub trait BlockRewriter: Send + Sync {
    /// Produce `output`'s objects from `inputs`; must not write its meta
    async fn rewrite(&self, backend: &Backend, inputs: &[BlockMeta], output: &BlockMeta)
        -> Result<()>;
}

/// Concatenates the inputs' `data` objects
///
/// Inputs without a data object contribute nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatRewriter;

#[async_trait]
impl BlockRewriter for ConcatRewriter {
    async fn rewrite(
        &self,
        backend: &Backend,
        inputs: &[BlockMeta],
        output: &BlockMeta,
    ) -> Result<()> {
        let mut data = BytesMut::new();
        for input in inputs {
            match backend
                .get_object(&input.tenant_id, input.block_id, DATA_NAME)
                .await
            {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(e) if e.is_not_found() => {
                    debug!(tenant = %input.tenant_id, block = %input.block_id, "input block has no data");
                }
                Err(e) => return Err(e),
            }
        }
        backend
            .put_object(&output.tenant_id, output.block_id, DATA_NAME, data.freeze())
            .await
    }
}

/// Result of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Jobs this instance owned
    pub jobs: usize,
    pub compacted: usize,
    /// Jobs given up before the output became visible
    pub abandoned: usize,
    pub failed: usize,
}

/// Compacts and retires the blocks this instance owns
pub struct Compactor {
    config: CompactorConfig,
    backend: Backend,
    blocklist: Arc<Blocklist>,
    sharder: Arc<dyn JobSharder>,
    selector: BlockSelector,
    rewriter: Arc<dyn BlockRewriter>,
    metrics: Arc<CompactorMetrics>,
}

impl Compactor {
    pub fn new(
        config: CompactorConfig,
        backend: Backend,
        blocklist: Arc<Blocklist>,
        sharder: Arc<dyn JobSharder>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            selector: BlockSelector::new(&config),
            config,
            backend,
            blocklist,
            sharder,
            rewriter: Arc::new(ConcatRewriter),
            metrics: Arc::new(CompactorMetrics::new()),
        })
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn BlockRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn metrics(&self) -> &Arc<CompactorMetrics> {
        &self.metrics
    }

    /// Run every owned job across all tenants in the blocklist
    ///
    /// A failed job is logged and left for the next pass.
    pub async fn compact_once(&self) -> CompactionSummary {
        let mut summary = CompactionSummary::default();

        for tenant in self.blocklist.tenants() {
            let snapshot = self.blocklist.snapshot(&tenant);
            for job in self.selector.select(&snapshot) {
                if !self.sharder.owns(&job.key()) {
                    continue;
                }
                summary.jobs += 1;

                match self.compact(&job).await {
                    Ok(Some(_)) => summary.compacted += 1,
                    Ok(None) => summary.abandoned += 1,
                    Err(e) => {
                        summary.failed += 1;
                        self.metrics.record_compaction_error();
                        if e.is_permanent() {
                            error!(tenant = %job.tenant, job = %job.key(), error = %e, "compaction failed");
                        } else {
                            warn!(tenant = %job.tenant, job = %job.key(), error = %e, "compaction failed");
                        }
                    }
                }
            }
        }

        if summary.jobs > 0 {
            info!(
                jobs = summary.jobs,
                compacted = summary.compacted,
                abandoned = summary.abandoned,
                failed = summary.failed,
                "compaction pass complete"
            );
        }
        summary
    }

    /// Compact one job, returning the output meta once it is visible
    ///
    /// Returns `None` when ownership moved while the output was being
    /// written, or when an input no longer has a live meta. The partial
    /// output is left orphaned in both cases.
    pub async fn compact(&self, job: &CompactionJob) -> Result<Option<BlockMeta>> {
        let output = BlockMeta::merged(&job.blocks)?;
        debug!(
            tenant = %job.tenant,
            job = %job.key(),
            output = %output.block_id,
            inputs = job.blocks.len(),
            "compacting blocks"
        );

        self.rewriter
            .rewrite(&self.backend, &job.blocks, &output)
            .await?;

        if !self.sharder.owns(&job.key()) {
            self.metrics.record_ownership_lost();
            warn!(
                tenant = %job.tenant,
                job = %job.key(),
                output = %output.block_id,
                "lost job ownership, abandoning output"
            );
            return Ok(None);
        }

        // the local view may predate another pass that already merged these
        for input in &job.blocks {
            match self.backend.block_meta(&job.tenant, input.block_id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    warn!(
                        tenant = %job.tenant,
                        job = %job.key(),
                        input = %input.block_id,
                        output = %output.block_id,
                        "input block is no longer live, abandoning output"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        self.backend.write_block_meta(&output).await?;

        let now = Utc::now();
        let mut retired = Vec::with_capacity(job.blocks.len());
        for input in &job.blocks {
            retired.push(
                self.backend
                    .mark_block_compacted(&job.tenant, input.block_id, now)
                    .await?,
            );
        }

        self.blocklist.update(
            &job.tenant,
            BlocklistUpdate {
                add: vec![output.clone()],
                remove: job.block_ids(),
                compacted_add: retired,
                compacted_remove: Vec::new(),
            },
        );
        self.metrics.record_compaction(job.blocks.len());

        info!(
            tenant = %job.tenant,
            output = %output.block_id,
            level = output.compaction_level,
            inputs = job.blocks.len(),
            objects = output.total_objects,
            "compacted blocks"
        );
        Ok(Some(output))
    }

    /// Compact and apply retention every `compaction_cycle` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.compaction_cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            cycle_secs = self.config.compaction_cycle.as_secs(),
            "compactor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async {
                    self.compact_once().await;
                    self.retention_once().await;
                } => {}
            }
        }

        info!("compactor stopped");
    }
}
