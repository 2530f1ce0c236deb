//! Deletion of old completed jobs.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::CleanupConfig;
use crate::store::{JobStore, StoreError};

/// Removes completed jobs (and their requests) past the retention window.
#[derive(Debug, Clone, Default)]
pub struct JobCleanup {
    config: CleanupConfig,
}

impl JobCleanup {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Oldest `updated_at` a completed job may have and survive.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Delete expired jobs; returns how many were removed.
    pub fn run<S: JobStore + ?Sized>(&self, store: &S, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = self.cutoff(now);
        let deleted = store.delete_completed_older_than(cutoff)?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "deleted completed jobs");
        }
        Ok(deleted)
    }
}
