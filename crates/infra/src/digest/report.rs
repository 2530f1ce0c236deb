//! Per-cycle and per-job outcomes.

use serde::Serialize;
use uuid::Uuid;

use loyaltysync_core::{RequestId, RetryDecision};

/// How processing of one job ended in this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Every request is synced; the job is completed.
    Completed { executed: usize },
    /// A request raised the illegal-job condition; the job is completed.
    Illegal { request_id: RequestId, reason: String },
    /// An earlier job with the same relation is still open.
    SkippedParent,
    /// The retry gate blocked a request; later requests wait too.
    Deferred {
        request_id: RequestId,
        decision: RetryDecision,
    },
    /// A request failed (or could not be persisted); the job stays open.
    Failed { request_id: RequestId, executed: usize },
    /// The job's state could not be loaded or saved.
    StoreFailure { error: String },
    /// The job was already completed when asked to run it.
    AlreadyCompleted,
}

impl JobOutcome {
    /// Whether the job is completed after this run.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            JobOutcome::Completed { .. } | JobOutcome::Illegal { .. } | JobOutcome::AlreadyCompleted
        )
    }
}

/// Counters for one digest cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DigestReport {
    pub cycle_id: Option<Uuid>,
    pub jobs_selected: usize,
    pub jobs_completed: usize,
    pub jobs_illegal: usize,
    pub jobs_skipped_parent: usize,
    pub jobs_deferred: usize,
    pub jobs_failed: usize,
    pub requests_executed: usize,
    pub requests_failed: usize,
    pub repairs_spawned: usize,
}

impl DigestReport {
    pub fn new(cycle_id: Uuid) -> Self {
        Self {
            cycle_id: Some(cycle_id),
            ..Self::default()
        }
    }

    /// Count the outcome of a selected job.
    pub fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { .. } | JobOutcome::AlreadyCompleted => self.jobs_completed += 1,
            JobOutcome::Illegal { .. } => self.jobs_illegal += 1,
            JobOutcome::SkippedParent => self.jobs_skipped_parent += 1,
            JobOutcome::Deferred { .. } => self.jobs_deferred += 1,
            JobOutcome::Failed { .. } | JobOutcome::StoreFailure { .. } => self.jobs_failed += 1,
        }
    }
}
