use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use loyaltysync_core::{Job, JobId, NewJob, NewRequest, Request, RequestId, TypeCode};

use super::r#trait::{JobStats, JobStore, StoreError};

#[derive(Debug, Default)]
struct State {
    last_job_id: u64,
    last_request_id: u64,
    jobs: BTreeMap<JobId, Job>,
    requests: BTreeMap<RequestId, Request>,
    /// Request ids per job in insertion order.
    job_requests: BTreeMap<JobId, Vec<RequestId>>,
}

impl State {
    fn insert_job(&mut self, job: NewJob) -> Job {
        self.last_job_id += 1;
        let job = job.into_job(JobId::new(self.last_job_id));
        self.jobs.insert(job.id, job.clone());
        self.job_requests.insert(job.id, Vec::new());
        job
    }

    fn insert_request(&mut self, job_id: JobId, request: NewRequest) -> Result<Request, StoreError> {
        let ids = self
            .job_requests
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        self.last_request_id += 1;
        let request = request.into_request(RequestId::new(self.last_request_id), job_id);
        ids.push(request.id);
        self.requests.insert(request.id, request.clone());
        Ok(request)
    }
}

/// In-memory job store.
///
/// Intended for tests/dev. Ids are assigned monotonically, so a lower job id
/// always means an earlier job.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs (any state).
    pub fn job_count(&self) -> usize {
        self.state.read().map(|s| s.jobs.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        Ok(self.write()?.insert_job(job))
    }

    fn insert_request(&self, job_id: JobId, request: NewRequest) -> Result<Request, StoreError> {
        self.write()?.insert_request(job_id, request)
    }

    fn insert_job_with_requests(
        &self,
        job: NewJob,
        requests: Vec<NewRequest>,
    ) -> Result<(Job, Vec<Request>), StoreError> {
        // Single lock: the job and its requests appear together or not at all.
        let mut state = self.write()?;
        let job = state.insert_job(job);
        let mut persisted = Vec::with_capacity(requests.len());
        for request in requests {
            persisted.push(state.insert_request(job.id, request)?);
        }
        Ok((job, persisted))
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StoreError::JobNotFound(job.id)),
        }
    }

    fn save_request(&self, request: &Request) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.jobs.contains_key(&request.job_id) {
            return Err(StoreError::JobNotFound(request.job_id));
        }
        match state.requests.get_mut(&request.id) {
            Some(stored) => {
                *stored = request.clone();
                Ok(())
            }
            None => Err(StoreError::RequestNotFound(request.id)),
        }
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn get_request(&self, request_id: RequestId) -> Result<Option<Request>, StoreError> {
        Ok(self.read()?.requests.get(&request_id).cloned())
    }

    fn requests_for(&self, job_id: JobId) -> Result<Vec<Request>, StoreError> {
        let state = self.read()?;
        let ids = state
            .job_requests
            .get(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        ids.iter()
            .map(|id| {
                state
                    .requests
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::Corrupt(format!("request {id} of job {job_id} missing")))
            })
            .collect()
    }

    fn find_due_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.is_open())
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_due_jobs_after(&self, after: JobId, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        Ok(state
            .jobs
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, j)| j)
            .filter(|j| j.is_open())
            .take(limit)
            .cloned()
            .collect())
    }

    fn has_uncompleted_parent(&self, job: &Job) -> Result<bool, StoreError> {
        let state = self.read()?;
        Ok(state
            .jobs
            .range(..job.id)
            .any(|(_, other)| other.is_open() && other.is_related_to(job)))
    }

    fn has_pending_request(&self, relation_id: &str, type_code: &TypeCode) -> Result<bool, StoreError> {
        let state = self.read()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.is_open() && j.relation_id.as_deref() == Some(relation_id))
            .filter_map(|j| state.job_requests.get(&j.id))
            .flatten()
            .filter_map(|id| state.requests.get(id))
            .any(|r| !r.is_synced && &r.type_code == type_code))
    }

    fn delete_completed_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.completed && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        for job_id in &expired {
            state.jobs.remove(job_id);
            if let Some(ids) = state.job_requests.remove(job_id) {
                for id in ids {
                    state.requests.remove(&id);
                }
            }
        }
        Ok(expired.len())
    }

    fn stats(&self, max_retries: u32) -> Result<JobStats, StoreError> {
        let state = self.read()?;
        let mut stats = JobStats::default();

        for job in state.jobs.values() {
            if job.completed {
                stats.completed_jobs += 1;
            } else {
                stats.open_jobs += 1;
            }
        }

        for request in state.requests.values().filter(|r| !r.is_synced) {
            stats.pending_requests += 1;
            if request.attempt > 0 {
                stats.failing_requests += 1;
            }
            if request.effective_attempt() >= i64::from(max_retries) {
                stats.stuck_requests += 1;
            }
        }

        Ok(stats)
    }
}
