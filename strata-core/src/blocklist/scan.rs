//! Full listing of a tenant's blocks

use super::BlocklistSnapshot;
use crate::backend::Backend;
use crate::index::sort_metas;
use crate::{BlockMeta, Result, StrataError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Blocks found by a full scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub metas: Vec<BlockMeta>,
    pub compacted_metas: Vec<BlockMeta>,
    /// Blocks left out because their meta could not be decoded
    pub skipped: usize,
}

/// Lists a tenant's blocks and resolves their metas
#[derive(Clone)]
pub struct BlockScanner {
    backend: Backend,
    concurrency: usize,
}

impl BlockScanner {
    pub fn new(backend: Backend, concurrency: usize) -> Self {
        Self {
            backend,
            concurrency: concurrency.max(1),
        }
    }

    /// Scan the bucket for `tenant`
    ///
    /// Metas already present in `previous` are reused; only blocks that are
    /// new, or that moved from live to compacted, are fetched.
    pub async fn scan(&self, tenant: &str, previous: &BlocklistSnapshot) -> Result<ScanResult> {
        let (live_ids, compacted_ids) = self.backend.blocks(tenant).await?;

        let known: HashMap<Uuid, &BlockMeta> =
            previous.metas.iter().map(|m| (m.block_id, m)).collect();
        let known_compacted: HashMap<Uuid, &BlockMeta> = previous
            .compacted_metas
            .iter()
            .map(|m| (m.block_id, m))
            .collect();

        let mut result = ScanResult {
            metas: Vec::with_capacity(live_ids.len()),
            compacted_metas: Vec::with_capacity(compacted_ids.len()),
            skipped: 0,
        };
        let mut unknown: Vec<(Uuid, bool)> = Vec::new();

        for id in live_ids {
            match known.get(&id) {
                Some(meta) => result.metas.push((*meta).clone()),
                None => unknown.push((id, false)),
            }
        }
        for id in compacted_ids {
            match known_compacted.get(&id) {
                Some(meta) => result.compacted_metas.push((*meta).clone()),
                None => unknown.push((id, true)),
            }
        }

        debug!(
            tenant,
            reused = result.metas.len() + result.compacted_metas.len(),
            unknown = unknown.len(),
            "scanning tenant blocks"
        );

        self.poll_unknown(tenant, unknown, &mut result).await?;

        sort_metas(&mut result.metas);
        sort_metas(&mut result.compacted_metas);
        Ok(result)
    }

    async fn poll_unknown(
        &self,
        tenant: &str,
        unknown: Vec<(Uuid, bool)>,
        result: &mut ScanResult,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (block_id, compacted) in unknown {
            let semaphore = semaphore.clone();
            let backend = self.backend.clone();
            let tenant = tenant.to_string();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| StrataError::Cancelled)?;
                poll_block(&backend, &tenant, block_id, compacted).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let polled = joined.map_err(|e| StrataError::Internal(format!("poll task failed: {}", e)))?;
            match polled {
                Ok(PolledBlock::Live(meta)) => result.metas.push(meta),
                Ok(PolledBlock::Compacted(meta)) => result.compacted_metas.push(meta),
                Ok(PolledBlock::Missing) => {}
                Ok(PolledBlock::Corrupt) => result.skipped += 1,
                Err(e) => {
                    // remaining lookups are pointless once the tenant has failed
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

enum PolledBlock {
    Live(BlockMeta),
    Compacted(BlockMeta),
    /// Neither meta exists, the block is mid-write or mid-delete
    Missing,
    Corrupt,
}

async fn poll_block(
    backend: &Backend,
    tenant: &str,
    block_id: Uuid,
    compacted: bool,
) -> Result<PolledBlock> {
    if !compacted {
        match backend.block_meta(tenant, block_id).await {
            Ok(meta) => return Ok(PolledBlock::Live(meta)),
            // compacted between listing and fetch
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_decode() => {
                warn!(tenant, block = %block_id, error = %e, "skipping block with corrupt meta");
                return Ok(PolledBlock::Corrupt);
            }
            Err(e) => return Err(e),
        }
    }

    match backend.compacted_block_meta(tenant, block_id).await {
        Ok(meta) => Ok(PolledBlock::Compacted(meta)),
        Err(e) if e.is_not_found() => Ok(PolledBlock::Missing),
        Err(e) if e.is_decode() => {
            warn!(tenant, block = %block_id, error = %e, "skipping block with corrupt compacted meta");
            Ok(PolledBlock::Corrupt)
        }
        Err(e) => Err(e),
    }
}
