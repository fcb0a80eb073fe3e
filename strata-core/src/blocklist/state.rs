//! Per-tenant polling state machine
//!
//! ```text
//!   Fresh ──stale index──▶ Stale ──fallback──▶ FullScan ──index ok──▶ Fresh
//!     │                      │                    │
//!     └───────── errors > tolerance ─────────────▶ Degraded
//! ```
//!
//! `Degraded` is left only by a successful poll. No transition ever touches
//! the cached snapshot.

use crate::{StrataError, Timestamp};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// Snapshot built from an index within the staleness bound
    Fresh,
    /// Index found but too old
    Stale,
    /// Snapshot built from a full listing
    FullScan,
    /// Too many consecutive failures, serving the last good snapshot
    Degraded,
}

/// How a successful tenant poll obtained its blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSuccess {
    /// Fetched an acceptable tenant index
    Index { age: Duration },
    /// Built and published the index as one of the tenant's builders
    Built,
    /// Fell back to listing the bucket
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantPollStatus {
    pub state: PollState,
    pub consecutive_errors: usize,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_error_at: Option<Timestamp>,
    /// Age of the last accepted index, in seconds
    pub index_age_seconds: Option<u64>,
}

impl Default for TenantPollStatus {
    fn default() -> Self {
        Self {
            state: PollState::Fresh,
            consecutive_errors: 0,
            last_success: None,
            last_error: None,
            last_error_at: None,
            index_age_seconds: None,
        }
    }
}

impl TenantPollStatus {
    pub fn is_degraded(&self) -> bool {
        self.state == PollState::Degraded
    }

    /// The index was found but is older than allowed
    pub fn record_stale(&mut self) {
        if self.state != PollState::Degraded {
            self.state = PollState::Stale;
        }
    }

    pub fn record_success(&mut self, success: PollSuccess) {
        self.consecutive_errors = 0;
        self.last_success = Some(Utc::now());
        match success {
            PollSuccess::Index { age } => {
                self.state = PollState::Fresh;
                self.index_age_seconds = Some(age.as_secs());
            }
            PollSuccess::Built => {
                self.state = PollState::Fresh;
                self.index_age_seconds = Some(0);
            }
            PollSuccess::Fallback => {
                self.state = PollState::FullScan;
            }
        }
    }

    /// Returns true when this failure moved the tenant into `Degraded`
    pub fn record_failure(&mut self, err: &StrataError, tolerance: usize) -> bool {
        self.consecutive_errors += 1;
        self.last_error = Some(err.to_string());
        self.last_error_at = Some(Utc::now());

        if matches!(err, StrataError::StaleIndex { .. }) {
            self.record_stale();
        }

        if self.consecutive_errors > tolerance && self.state != PollState::Degraded {
            self.state = PollState::Degraded;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> StrataError {
        StrataError::Transient("connection reset".into())
    }

    #[test]
    fn test_degrades_after_tolerance() {
        let mut status = TenantPollStatus::default();

        assert!(!status.record_failure(&transient(), 2));
        assert!(!status.record_failure(&transient(), 2));
        assert_eq!(status.state, PollState::Fresh);

        assert!(status.record_failure(&transient(), 2));
        assert!(status.is_degraded());

        // stays degraded without re-signalling
        assert!(!status.record_failure(&transient(), 2));
        assert_eq!(status.consecutive_errors, 4);
    }

    #[test]
    fn test_zero_tolerance_degrades_immediately() {
        let mut status = TenantPollStatus::default();
        assert!(status.record_failure(&transient(), 0));
    }

    #[test]
    fn test_success_leaves_degraded() {
        let mut status = TenantPollStatus::default();
        status.record_failure(&transient(), 0);
        assert!(status.is_degraded());

        status.record_success(PollSuccess::Fallback);
        assert_eq!(status.state, PollState::FullScan);
        assert_eq!(status.consecutive_errors, 0);

        status.record_success(PollSuccess::Index {
            age: Duration::from_secs(42),
        });
        assert_eq!(status.state, PollState::Fresh);
        assert_eq!(status.index_age_seconds, Some(42));
    }

    #[test]
    fn test_stale_transitions() {
        let mut status = TenantPollStatus::default();
        status.record_stale();
        assert_eq!(status.state, PollState::Stale);
        status.record_success(PollSuccess::Fallback);
        assert_eq!(status.state, PollState::FullScan);

        let stale = StrataError::StaleIndex {
            tenant: "t1".into(),
            created_at: Utc::now(),
        };
        assert!(!status.record_failure(&stale, 1));
        assert_eq!(status.state, PollState::Stale);
        assert!(status.record_failure(&stale, 1));
        assert_eq!(status.state, PollState::Degraded);
    }
}
