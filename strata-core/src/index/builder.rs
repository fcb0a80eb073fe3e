use super::TenantIndex;
use crate::backend::Backend;
use crate::blocklist::{BlockScanner, BlocklistSnapshot};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Decides whether this instance owns a named job
pub trait JobSharder: Send + Sync {
    fn owns(&self, job: &str) -> bool;
}

/// Never owns a job; used by read-only components
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnsNothingSharder;

impl JobSharder for OwnsNothingSharder {
    fn owns(&self, _job: &str) -> bool {
        false
    }
}

/// Owns every job; used when a single instance runs everything
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnsEverythingSharder;

impl JobSharder for OwnsEverythingSharder {
    fn owns(&self, _job: &str) -> bool {
        true
    }
}

/// Job name for the `i`th builder slot of a tenant
pub fn builder_job(slot: usize, tenant: &str) -> String {
    format!("build-tenant-index-{}-{}", slot, tenant)
}

/// Builds and publishes tenant indexes for the tenants this instance owns
#[derive(Clone)]
pub struct TenantIndexBuilder {
    backend: Backend,
    scanner: BlockScanner,
    sharder: Arc<dyn JobSharder>,
    builders: usize,
}

impl TenantIndexBuilder {
    pub fn new(
        backend: Backend,
        scanner: BlockScanner,
        sharder: Arc<dyn JobSharder>,
        builders: usize,
    ) -> Self {
        Self {
            backend,
            scanner,
            sharder,
            builders: builders.max(1),
        }
    }

    /// Whether this instance holds any builder slot for `tenant`
    ///
    /// Every slot is its own job so a ring assigns each one independently. An
    /// instance configured with more slots than its peers checks more jobs
    /// and can only add builders, never remove them.
    pub fn is_builder(&self, tenant: &str) -> bool {
        (0..self.builders).any(|slot| self.sharder.owns(&builder_job(slot, tenant)))
    }

    /// Scan the bucket and assemble a fresh index
    pub async fn build(&self, tenant: &str, previous: &BlocklistSnapshot) -> Result<TenantIndex> {
        let scanned = self.scanner.scan(tenant, previous).await?;
        let index = TenantIndex::new(tenant, Utc::now(), scanned.metas, scanned.compacted_metas);
        debug!(
            tenant,
            blocks = index.metas.len(),
            compacted = index.compacted_metas.len(),
            skipped = scanned.skipped,
            "built tenant index"
        );
        Ok(index)
    }

    /// Replace the stored index with `index`
    ///
    /// An index with no blocks is deleted instead, so a tenant whose blocks
    /// have all been cleared drops out of the bucket listing.
    pub async fn publish(&self, index: &TenantIndex) -> Result<()> {
        if index.is_empty() {
            self.backend.delete_tenant_index(&index.tenant_id).await?;
            info!(tenant = %index.tenant_id, "tenant has no blocks, removed tenant index");
            return Ok(());
        }

        self.backend.write_tenant_index(index).await?;
        info!(
            tenant = %index.tenant_id,
            blocks = index.metas.len(),
            compacted = index.compacted_metas.len(),
            "published tenant index"
        );
        Ok(())
    }
}
