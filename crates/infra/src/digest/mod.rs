//! Job digest: the runner that executes due jobs.
//!
//! ## Cycle
//!
//! ```text
//! select up to batch_size open jobs, resuming after the last job selected
//!   ↓ per job
//! parent gate (skip while an earlier job of the same relation is open)
//!   ↓ per request, in stored order
//! synced? → carry its result forward
//! retry gate → blocked: stop this job for the cycle
//! dispatch (unpack → before → execute → after) → persist
//!   ↓ error
//! default handling → persist → failure hooks (may run a corrective job) → stop this job
//!   ↓ all synced
//! mark job completed
//! ```
//!
//! Selection walks the open jobs round-robin, so jobs that cannot progress
//! (past the retry ceiling, waiting on backoff) never starve newer ones.
//!
//! Errors of a single job never escape the cycle; only a failure to select
//! the batch does. Everything runs on the caller's thread.

pub mod hooks;
pub mod report;

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use loyaltysync_core::{Clock, Job, JobId, Request};

use crate::builder::{DebounceHistory, JobBuilder, JobDraft};
use crate::config::DigestConfig;
use crate::registry::{HandlerError, RequestTypeRegistry};
use crate::store::{JobStore, StoreError};

pub use hooks::{
    DependencyRepair, FailureHook, FailureReaction, PendingTypeOverride, RequestFailure,
    ValidationOverride,
};
pub use report::{DigestReport, JobOutcome};

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Bypass the parent gate and the retry gate.
    pub skip_validation: bool,
}

impl RunOptions {
    /// Regular scheduled processing.
    pub fn scheduled() -> Self {
        Self::default()
    }

    /// Run right away, e.g. just after the job was created.
    pub fn immediate() -> Self {
        Self {
            skip_validation: true,
        }
    }
}

/// Executes jobs against a store through a request type registry.
pub struct JobDigest<S: JobStore> {
    store: S,
    registry: Arc<RequestTypeRegistry>,
    clock: Arc<dyn Clock>,
    config: DigestConfig,
    failure_hooks: Vec<Box<dyn FailureHook>>,
    overrides: Vec<Box<dyn ValidationOverride>>,
    /// Corrective jobs already spawned during the current invocation.
    repair_history: Mutex<DebounceHistory>,
    /// Last job selected by the previous cycle.
    cursor: Mutex<Option<JobId>>,
}

impl<S: JobStore> JobDigest<S> {
    pub fn new(store: S, registry: Arc<RequestTypeRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
            config: DigestConfig::default(),
            failure_hooks: Vec::new(),
            overrides: Vec::new(),
            repair_history: Mutex::new(DebounceHistory::new()),
            cursor: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: DigestConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a failure hook; hooks run in registration order.
    pub fn on_failure(mut self, hook: impl FailureHook + 'static) -> Self {
        self.failure_hooks.push(Box::new(hook));
        self
    }

    /// Register a parent-gate override.
    pub fn with_validation_override(mut self, o: impl ValidationOverride + 'static) -> Self {
        self.overrides.push(Box::new(o));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run one digest cycle over up to `batch_size` open jobs.
    pub fn run(&self) -> Result<DigestReport, StoreError> {
        let cycle_id = Uuid::now_v7();
        let span = info_span!("digest", cycle_id = %cycle_id);
        let _enter = span.enter();

        self.reset_repair_history();

        let jobs = self.select_batch()?;
        let mut report = DigestReport::new(cycle_id);
        report.jobs_selected = jobs.len();

        for job in jobs {
            let job_id = job.id;
            let outcome = self.process(job, RunOptions::scheduled(), 0, &mut report);
            debug!(job_id = %job_id, outcome = ?outcome, "job processed");
            report.record(&outcome);
        }

        info!(
            selected = report.jobs_selected,
            completed = report.jobs_completed + report.jobs_illegal,
            skipped_parent = report.jobs_skipped_parent,
            deferred = report.jobs_deferred,
            failed = report.jobs_failed,
            executed = report.requests_executed,
            repairs = report.repairs_spawned,
            "digest cycle finished"
        );
        Ok(report)
    }

    /// Run a single job now, outside batch selection.
    pub fn run_job(&self, job_id: JobId, options: RunOptions) -> Result<JobOutcome, StoreError> {
        let span = info_span!("digest_job", job_id = %job_id);
        let _enter = span.enter();

        let job = self
            .store
            .get_job(job_id)?
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.completed {
            return Ok(JobOutcome::AlreadyCompleted);
        }

        self.reset_repair_history();
        let mut report = DigestReport::default();
        Ok(self.process(job, options, 0, &mut report))
    }

    /// Next batch of open jobs, continuing after the previous cycle's last
    /// job and wrapping around to the oldest ones.
    fn select_batch(&self) -> Result<Vec<Job>, StoreError> {
        let limit = self.config.batch_size;
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());

        let jobs = match *cursor {
            None => self.store.find_due_jobs(limit)?,
            Some(after) => {
                let mut jobs = self.store.find_due_jobs_after(after, limit)?;
                if jobs.len() < limit {
                    let head = self.store.find_due_jobs(limit - jobs.len())?;
                    jobs.extend(head.into_iter().filter(|j| j.id <= after));
                }
                jobs
            }
        };

        *cursor = jobs.last().map(|j| j.id);
        Ok(jobs)
    }

    fn reset_repair_history(&self) {
        self.repair_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn process(&self, mut job: Job, options: RunOptions, depth: u32, report: &mut DigestReport) -> JobOutcome {
        let requests = match self.store.requests_for(job.id) {
            Ok(requests) => requests,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to load requests");
                return JobOutcome::StoreFailure { error: e.to_string() };
            }
        };

        if !options.skip_validation {
            match self.blocked_by_parent(&job, &requests) {
                Ok(false) => {}
                Ok(true) => {
                    debug!(job_id = %job.id, relation_id = ?job.relation_id, "waiting for uncompleted parent job");
                    return JobOutcome::SkippedParent;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "parent lookup failed");
                    return JobOutcome::StoreFailure { error: e.to_string() };
                }
            }
        }

        let gate_retries = !options.skip_validation && !self.config.skip_retry_gate;
        let mut previous: Option<JsonValue> = None;
        let mut executed = 0;

        for mut request in requests {
            if request.is_synced {
                previous = request.result.clone();
                continue;
            }

            if gate_retries {
                let decision = self
                    .config
                    .retry
                    .decide(request.attempt, request.updated_at, self.clock.now());
                if !decision.is_ready() {
                    debug!(
                        job_id = %job.id,
                        request_id = %request.id,
                        attempt = request.attempt,
                        decision = ?decision,
                        "request not eligible yet"
                    );
                    return JobOutcome::Deferred {
                        request_id: request.id,
                        decision,
                    };
                }
            }

            request.begin_attempt();
            executed += 1;
            report.requests_executed += 1;

            match self.registry.dispatch(&job, &request, previous.as_ref()) {
                Ok(result) => {
                    request.mark_synced(result, self.clock.now());
                    if let Err(e) = self.store.save_request(&request) {
                        error!(job_id = %job.id, request_id = %request.id, error = %e, "failed to persist synced request");
                        report.requests_failed += 1;
                        return JobOutcome::Failed {
                            request_id: request.id,
                            executed,
                        };
                    }
                    previous = request.result.clone();
                }
                Err(err) => {
                    report.requests_failed += 1;
                    return self.handle_failure(&mut job, request, err, executed, depth, report);
                }
            }
        }

        job.mark_completed(self.clock.now());
        if let Err(e) = self.store.save_job(&job) {
            error!(job_id = %job.id, error = %e, "failed to persist completed job");
            return JobOutcome::StoreFailure { error: e.to_string() };
        }
        info!(job_id = %job.id, executed, "job completed");
        JobOutcome::Completed { executed }
    }

    fn blocked_by_parent(&self, job: &Job, requests: &[Request]) -> Result<bool, StoreError> {
        if !self.store.has_uncompleted_parent(job)? {
            return Ok(false);
        }
        if self.overrides.iter().any(|o| o.force_valid(job, requests)) {
            debug!(job_id = %job.id, "parent gate overridden");
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_failure(
        &self,
        job: &mut Job,
        mut request: Request,
        error: HandlerError,
        executed: usize,
        depth: u32,
        report: &mut DigestReport,
    ) -> JobOutcome {
        let now = self.clock.now();
        let illegal_reason = match &error {
            HandlerError::IllegalJob(reason) => {
                warn!(
                    job_id = %job.id,
                    request_id = %request.id,
                    type_code = %request.type_code,
                    reason = %reason,
                    "illegal job; resolving without retry"
                );
                request.mark_ignored(reason.clone(), now);
                Some(reason.clone())
            }
            other => {
                warn!(
                    job_id = %job.id,
                    request_id = %request.id,
                    type_code = %request.type_code,
                    attempt = request.attempt,
                    error = %other,
                    "request failed"
                );
                request.mark_failed(other.detail(), now);
                None
            }
        };

        let saved = match self.store.save_request(&request) {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %job.id, request_id = %request.id, error = %e, "failed to persist failed request");
                false
            }
        };

        self.run_failure_hooks(job, &request, &error, depth, report);

        match illegal_reason {
            Some(reason) if saved => {
                job.mark_completed(now);
                if let Err(e) = self.store.save_job(job) {
                    error!(job_id = %job.id, error = %e, "failed to persist completed job");
                    return JobOutcome::StoreFailure { error: e.to_string() };
                }
                JobOutcome::Illegal {
                    request_id: request.id,
                    reason,
                }
            }
            _ => JobOutcome::Failed {
                request_id: request.id,
                executed,
            },
        }
    }

    fn run_failure_hooks(
        &self,
        job: &Job,
        request: &Request,
        error: &HandlerError,
        depth: u32,
        report: &mut DigestReport,
    ) {
        let failure = RequestFailure { job, request, error };
        for hook in &self.failure_hooks {
            match hook.on_failure(&failure) {
                FailureReaction::Pass => continue,
                FailureReaction::Stop => break,
                FailureReaction::Repair(draft) => {
                    self.repair(job, draft, depth, report);
                    break;
                }
            }
        }
    }

    /// Create a corrective job and run it immediately.
    fn repair(&self, origin: &Job, draft: JobDraft, depth: u32, report: &mut DigestReport) {
        if depth >= self.config.max_repair_depth {
            warn!(origin_job_id = %origin.id, depth, "repair depth reached; not spawning corrective job");
            return;
        }

        match self.repair_pending(&draft) {
            Ok(false) => {}
            Ok(true) => {
                debug!(
                    origin_job_id = %origin.id,
                    relation_id = ?draft.relation_id,
                    "corrective job already pending; not spawning another"
                );
                return;
            }
            Err(e) => {
                error!(origin_job_id = %origin.id, error = %e, "pending repair lookup failed");
                return;
            }
        }

        let draft = match draft.source_id {
            Some(_) => draft,
            None => draft.with_source(self.config.repair_source_id.clone()),
        };

        let history = std::mem::take(&mut *self.repair_history.lock().unwrap_or_else(|e| e.into_inner()));
        let mut builder = JobBuilder::new(&self.store, self.clock.clone()).with_history(history);
        let created = builder.create_from(draft, true);
        *self.repair_history.lock().unwrap_or_else(|e| e.into_inner()) = builder.into_history();

        match created {
            Ok(Some(job)) => {
                report.repairs_spawned += 1;
                info!(job_id = %job.id, origin_job_id = %origin.id, "running corrective job");
                let outcome = self.process(job, RunOptions::immediate(), depth + 1, report);
                debug!(origin_job_id = %origin.id, outcome = ?outcome, "corrective job finished");
            }
            Ok(None) => {
                debug!(origin_job_id = %origin.id, "corrective job already spawned in this run");
            }
            Err(e) => {
                error!(origin_job_id = %origin.id, error = %e, "failed to create corrective job");
            }
        }
    }

    /// Whether an open job of the draft's relation already holds every
    /// drafted request type unsynced.
    fn repair_pending(&self, draft: &JobDraft) -> Result<bool, StoreError> {
        let Some(relation_id) = draft.relation_id.as_deref() else {
            return Ok(false);
        };
        if draft.requests.is_empty() {
            return Ok(false);
        }
        for (type_code, _) in &draft.requests {
            if !self.store.has_pending_request(relation_id, type_code)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
