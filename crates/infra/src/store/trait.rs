use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use loyaltysync_core::{Job, JobId, NewJob, NewRequest, Request, RequestId, TypeCode};

/// Job store abstraction.
///
/// Implementations assign ids on insert and return requests in stored
/// (insertion) order. The engine assumes a single writer at a time.
pub trait JobStore: Send + Sync {
    /// Persist a new job and assign its id.
    fn insert_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Persist a new request for an existing job.
    fn insert_request(&self, job_id: JobId, request: NewRequest) -> Result<Request, StoreError>;

    /// Persist a job together with its requests.
    ///
    /// The default implementation inserts sequentially; stores that can should
    /// override it to commit atomically.
    fn insert_job_with_requests(
        &self,
        job: NewJob,
        requests: Vec<NewRequest>,
    ) -> Result<(Job, Vec<Request>), StoreError> {
        let job = self.insert_job(job)?;
        let mut persisted = Vec::with_capacity(requests.len());
        for request in requests {
            persisted.push(self.insert_request(job.id, request)?);
        }
        Ok((job, persisted))
    }

    /// Update an existing job.
    fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Update an existing request.
    fn save_request(&self, request: &Request) -> Result<(), StoreError>;

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    fn get_request(&self, request_id: RequestId) -> Result<Option<Request>, StoreError>;

    /// Requests of a job in execution order.
    fn requests_for(&self, job_id: JobId) -> Result<Vec<Request>, StoreError>;

    /// Up to `limit` uncompleted jobs, oldest first.
    fn find_due_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Up to `limit` uncompleted jobs with an id above `after`, oldest first.
    fn find_due_jobs_after(&self, after: JobId, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Whether an earlier, uncompleted job shares this job's relation id.
    fn has_uncompleted_parent(&self, job: &Job) -> Result<bool, StoreError>;

    /// Whether an uncompleted job of `relation_id` still holds an unsynced
    /// request of `type_code`.
    fn has_pending_request(&self, relation_id: &str, type_code: &TypeCode) -> Result<bool, StoreError>;

    /// Delete completed jobs (and their requests) last updated before `cutoff`.
    fn delete_completed_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Counters for operators; `max_retries` decides which requests count as stuck.
    fn stats(&self, max_retries: u32) -> Result<JobStats, StoreError>;

    /// Operator intervention: reset a request's attempt counter.
    fn reset_request(&self, request_id: RequestId, now: DateTime<Utc>) -> Result<Request, StoreError> {
        let mut request = self
            .get_request(request_id)?
            .ok_or(StoreError::RequestNotFound(request_id))?;
        request.reset_attempts(now);
        self.save_request(&request)?;
        Ok(request)
    }
}

/// Job store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub open_jobs: usize,
    pub completed_jobs: usize,
    /// Unsynced requests
    pub pending_requests: usize,
    /// Unsynced requests that failed at least once
    pub failing_requests: usize,
    /// Unsynced requests past the retry ceiling
    pub stuck_requests: usize,
}

macro_rules! forward_job_store {
    ($($ptr:tt)*) => {
        impl<S: JobStore + ?Sized> JobStore for $($ptr)* {
            fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
                (**self).insert_job(job)
            }

            fn insert_request(&self, job_id: JobId, request: NewRequest) -> Result<Request, StoreError> {
                (**self).insert_request(job_id, request)
            }

            fn insert_job_with_requests(
                &self,
                job: NewJob,
                requests: Vec<NewRequest>,
            ) -> Result<(Job, Vec<Request>), StoreError> {
                (**self).insert_job_with_requests(job, requests)
            }

            fn save_job(&self, job: &Job) -> Result<(), StoreError> {
                (**self).save_job(job)
            }

            fn save_request(&self, request: &Request) -> Result<(), StoreError> {
                (**self).save_request(request)
            }

            fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
                (**self).get_job(job_id)
            }

            fn get_request(&self, request_id: RequestId) -> Result<Option<Request>, StoreError> {
                (**self).get_request(request_id)
            }

            fn requests_for(&self, job_id: JobId) -> Result<Vec<Request>, StoreError> {
                (**self).requests_for(job_id)
            }

            fn find_due_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
                (**self).find_due_jobs(limit)
            }

            fn find_due_jobs_after(&self, after: JobId, limit: usize) -> Result<Vec<Job>, StoreError> {
                (**self).find_due_jobs_after(after, limit)
            }

            fn has_uncompleted_parent(&self, job: &Job) -> Result<bool, StoreError> {
                (**self).has_uncompleted_parent(job)
            }

            fn has_pending_request(&self, relation_id: &str, type_code: &TypeCode) -> Result<bool, StoreError> {
                (**self).has_pending_request(relation_id, type_code)
            }

            fn delete_completed_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
                (**self).delete_completed_older_than(cutoff)
            }

            fn stats(&self, max_retries: u32) -> Result<JobStats, StoreError> {
                (**self).stats(max_retries)
            }

            fn reset_request(&self, request_id: RequestId, now: DateTime<Utc>) -> Result<Request, StoreError> {
                (**self).reset_request(request_id, now)
            }
        }
    };
}

forward_job_store!(Arc<S>);
forward_job_store!(&S);
