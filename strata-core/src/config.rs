//! Configuration for polling, compaction, and ring membership
//!
//! Keys mirror the documented `storage.trace` surface so existing YAML files
//! load unchanged. Durations use humantime notation (`5m`, `30s`, `336h`).

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default interval between blocklist polls (5m)
pub const DEFAULT_BLOCKLIST_POLL: Duration = Duration::from_secs(5 * 60);

/// Default number of blocks/tenants polled in parallel
pub const DEFAULT_BLOCKLIST_POLL_CONCURRENCY: usize = 50;

/// Default number of instances building each tenant index
pub const DEFAULT_TENANT_INDEX_BUILDERS: usize = 2;

/// Default consecutive tenant failures tolerated before degrading
pub const DEFAULT_TOLERATE_CONSECUTIVE_ERRORS: usize = 1;

/// Default deadline for a single object store call
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default tokens registered per ring member
pub const DEFAULT_TOKENS_PER_INSTANCE: usize = 128;

/// Blocklist polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Interval between poll cycles
    #[serde(with = "humantime_serde")]
    pub blocklist_poll: Duration,
    /// Tenants (and unknown block metas) fetched in parallel
    pub blocklist_poll_concurrency: usize,
    /// Fall back to a full listing when the tenant index is unusable
    pub blocklist_poll_fallback: bool,
    /// Number of instances that build each tenant's index
    pub blocklist_poll_tenant_index_builders: usize,
    /// Maximum accepted tenant index age, zero disables the check
    #[serde(with = "humantime_serde")]
    pub blocklist_poll_stale_tenant_index: Duration,
    /// Maximum random delay applied before polling each tenant
    pub blocklist_poll_jitter_ms: u64,
    /// Consecutive failures tolerated before a tenant is degraded
    pub blocklist_poll_tolerate_consecutive_errors: usize,
    /// Deadline for one tenant's poll, zero means one poll interval
    #[serde(with = "humantime_serde")]
    pub blocklist_poll_tenant_timeout: Duration,
    /// Deadline for each object store call
    #[serde(with = "humantime_serde")]
    pub backend_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blocklist_poll: DEFAULT_BLOCKLIST_POLL,
            blocklist_poll_concurrency: DEFAULT_BLOCKLIST_POLL_CONCURRENCY,
            blocklist_poll_fallback: true,
            blocklist_poll_tenant_index_builders: DEFAULT_TENANT_INDEX_BUILDERS,
            blocklist_poll_stale_tenant_index: Duration::ZERO,
            blocklist_poll_jitter_ms: 0,
            blocklist_poll_tolerate_consecutive_errors: DEFAULT_TOLERATE_CONSECUTIVE_ERRORS,
            blocklist_poll_tenant_timeout: Duration::ZERO,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }
}

impl StorageConfig {
    /// Parse from a YAML document, applying defaults and validating
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: StorageConfig = serde_yaml::from_str(yaml)
            .map_err(|e| StrataError::Config(format!("failed to parse YAML: {}", e)))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Replace zero values with their defaults
    pub fn apply_defaults(&mut self) {
        if self.blocklist_poll.is_zero() {
            self.blocklist_poll = DEFAULT_BLOCKLIST_POLL;
        }
        if self.blocklist_poll_concurrency == 0 {
            self.blocklist_poll_concurrency = DEFAULT_BLOCKLIST_POLL_CONCURRENCY;
        }
        if self.blocklist_poll_tenant_index_builders == 0 {
            self.blocklist_poll_tenant_index_builders = DEFAULT_TENANT_INDEX_BUILDERS;
        }
        if self.blocklist_poll_tenant_timeout.is_zero() {
            self.blocklist_poll_tenant_timeout = self.blocklist_poll;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_timeout.is_zero() {
            return Err(StrataError::Config(
                "backend_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Staleness bound, `None` when disabled
    pub fn stale_tenant_index(&self) -> Option<Duration> {
        if self.blocklist_poll_stale_tenant_index.is_zero() {
            None
        } else {
            Some(self.blocklist_poll_stale_tenant_index)
        }
    }
}

/// Compaction and retention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    /// Width of the time windows blocks are grouped into
    #[serde(with = "humantime_serde")]
    pub compaction_window: Duration,
    /// Smallest group worth compacting
    pub min_input_blocks: usize,
    /// Largest group compacted in one job
    pub max_input_blocks: usize,
    /// Upper bound on the summed size of a job's inputs
    pub max_block_bytes: u64,
    /// Age after which live blocks are retired, zero disables
    #[serde(with = "humantime_serde")]
    pub block_retention: Duration,
    /// Time compacted blocks are kept before deletion
    #[serde(with = "humantime_serde")]
    pub compacted_block_retention: Duration,
    /// Interval between compaction/retention passes
    #[serde(with = "humantime_serde")]
    pub compaction_cycle: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            compaction_window: Duration::from_secs(60 * 60),
            min_input_blocks: 2,
            max_input_blocks: 4,
            max_block_bytes: 100 * 1024 * 1024 * 1024,
            block_retention: Duration::from_secs(14 * 24 * 60 * 60),
            compacted_block_retention: Duration::from_secs(60 * 60),
            compaction_cycle: Duration::from_secs(30),
        }
    }
}

impl CompactorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compaction_window.is_zero() {
            return Err(StrataError::Config(
                "compaction_window must be greater than zero".to_string(),
            ));
        }
        if self.compaction_cycle.is_zero() {
            return Err(StrataError::Config(
                "compaction_cycle must be greater than zero".to_string(),
            ));
        }
        if self.min_input_blocks < 2 {
            return Err(StrataError::Config(format!(
                "min_input_blocks must be at least 2, got {}",
                self.min_input_blocks
            )));
        }
        if self.max_input_blocks < self.min_input_blocks {
            return Err(StrataError::Config(format!(
                "max_input_blocks ({}) is less than min_input_blocks ({})",
                self.max_input_blocks, self.min_input_blocks
            )));
        }
        Ok(())
    }
}

/// Static ring membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// This instance's ID
    pub instance_id: String,
    /// Every instance participating in the ring
    pub members: Vec<String>,
    pub tokens_per_instance: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            instance_id: "strata-0".to_string(),
            members: Vec::new(),
            tokens_per_instance: DEFAULT_TOKENS_PER_INSTANCE,
        }
    }
}

impl RingConfig {
    /// Members including this instance, deduplicated
    pub fn all_members(&self) -> Vec<String> {
        let mut members = self.members.clone();
        members.push(self.instance_id.clone());
        members.sort();
        members.dedup();
        members
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(StrataError::Config("instance_id must not be empty".to_string()));
        }
        if self.tokens_per_instance == 0 {
            return Err(StrataError::Config(
                "tokens_per_instance must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
