//! Jobs: ordered batches of requests sharing a correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, StoreId};

/// A persisted job.
///
/// The job's requests are stored separately and executed in insertion order.
/// `completed` is terminal: a completed job is never selected again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the store on persist
    pub id: JobId,
    /// External correlation key (usually a customer id)
    pub relation_id: Option<String>,
    /// Subsystem that created the job
    pub source_id: String,
    /// Scope passed down to requests
    pub store_id: Option<StoreId>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_open(&self) -> bool {
        !self.completed
    }

    /// Mark the job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.completed = true;
        self.updated_at = now;
    }

    /// Whether `other` shares this job's relation id.
    ///
    /// Jobs without a relation id are never related to anything.
    pub fn is_related_to(&self, other: &Job) -> bool {
        match (&self.relation_id, &other.relation_id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub relation_id: Option<String>,
    pub source_id: String,
    pub store_id: Option<StoreId>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(
        relation_id: Option<String>,
        source_id: impl Into<String>,
        store_id: Option<StoreId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            relation_id,
            source_id: source_id.into(),
            store_id,
            created_at,
        }
    }

    /// Attach the store-assigned id.
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            relation_id: self.relation_id,
            source_id: self.source_id,
            store_id: self.store_id,
            completed: false,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
