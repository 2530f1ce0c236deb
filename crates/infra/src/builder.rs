//! Job builder with duplicate suppression (debounce).
//!
//! A single external trigger (e.g. a saved customer) can fire several times in
//! one logical operation. The builder collects requests in memory and drops
//! those whose fingerprint was already seen during its lifetime, before
//! anything is persisted.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use loyaltysync_core::{
    Clock, DomainError, Fingerprint, Job, NewJob, NewRequest, Payload, StoreId, TypeCode,
    fingerprint,
};

use crate::store::{JobStore, StoreError};

/// Source tag used when neither the call nor the builder names one.
pub const DEFAULT_SOURCE_ID: &str = "default";

/// Fingerprints seen by one builder.
///
/// Owned by the builder by default; callers that want to share suppression
/// across several builders pass one in with [`JobBuilder::with_history`] and
/// take it back with [`JobBuilder::into_history`].
#[derive(Debug, Clone, Default)]
pub struct DebounceHistory {
    seen: HashSet<Fingerprint>,
}

impl DebounceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Record a fingerprint; returns false if it was already present.
    pub fn record(&mut self, fingerprint: Fingerprint) -> bool {
        self.seen.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Builder error.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("no job in progress (call new_job first)")]
    NoJobInProgress,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A job description that has not been handed to a builder yet.
///
/// Used by failure hooks to describe corrective jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDraft {
    pub relation_id: Option<String>,
    pub store_id: Option<StoreId>,
    pub source_id: Option<String>,
    pub requests: Vec<(TypeCode, Payload)>,
}

impl JobDraft {
    pub fn new(relation_id: Option<String>, store_id: Option<StoreId>) -> Self {
        Self {
            relation_id,
            store_id,
            source_id: None,
            requests: Vec::new(),
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_request(mut self, type_code: impl Into<TypeCode>, payload: Payload) -> Self {
        self.requests.push((type_code.into(), payload));
        self
    }
}

#[derive(Debug)]
struct PendingJob {
    relation_id: Option<String>,
    source_id: String,
    store_id: Option<StoreId>,
    requests: Vec<(TypeCode, Payload)>,
}

/// Assembles a job and its requests, then commits them in one go.
pub struct JobBuilder<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
    default_source_id: String,
    default_store_id: Option<StoreId>,
    history: DebounceHistory,
    pending: Option<PendingJob>,
}

impl<S: JobStore> JobBuilder<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_source_id: DEFAULT_SOURCE_ID.to_string(),
            default_store_id: None,
            history: DebounceHistory::new(),
            pending: None,
        }
    }

    pub fn with_default_source(mut self, source_id: impl Into<String>) -> Self {
        self.default_source_id = source_id.into();
        self
    }

    pub fn with_default_store(mut self, store_id: StoreId) -> Self {
        self.default_store_id = Some(store_id);
        self
    }

    pub fn with_history(mut self, history: DebounceHistory) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &DebounceHistory {
        &self.history
    }

    pub fn into_history(self) -> DebounceHistory {
        self.history
    }

    /// Number of requests in the job being built.
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.requests.len())
    }

    /// Start a fresh job, discarding any unfinished one.
    pub fn new_job(
        &mut self,
        relation_id: Option<String>,
        store_id: Option<StoreId>,
        source_id: Option<String>,
    ) -> &mut Self {
        if let Some(discarded) = self.pending.take() {
            if !discarded.requests.is_empty() {
                debug!(
                    discarded = discarded.requests.len(),
                    "discarding unfinished job in builder"
                );
            }
        }
        self.pending = Some(PendingJob {
            relation_id,
            source_id: source_id.unwrap_or_else(|| self.default_source_id.clone()),
            store_id: store_id.or(self.default_store_id),
            requests: Vec::new(),
        });
        self
    }

    /// Append a request to the job in progress (not persisted yet).
    pub fn add_request(&mut self, payload: Payload, type_code: TypeCode) -> Result<&mut Self, BuilderError> {
        loyaltysync_core::payload::check_reserved(&payload)?;
        let pending = self.pending.as_mut().ok_or(BuilderError::NoJobInProgress)?;
        pending.requests.push((type_code, payload));
        Ok(self)
    }

    /// Commit the job in progress.
    ///
    /// With `debounce`, requests already seen by this builder (or repeated
    /// within this job) are dropped. Returns `None` without persisting when no
    /// request survives. The in-progress job is consumed either way.
    pub fn create(&mut self, debounce: bool) -> Result<Option<Job>, BuilderError> {
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };

        let now = self.clock.now();
        let mut fresh: Vec<Fingerprint> = Vec::new();
        let mut survivors = Vec::with_capacity(pending.requests.len());

        for (type_code, payload) in pending.requests {
            if debounce {
                let fp = fingerprint(pending.relation_id.as_deref(), &type_code, &payload);
                if self.history.contains(&fp) || fresh.contains(&fp) {
                    debug!(
                        relation_id = ?pending.relation_id,
                        type_code = %type_code,
                        "debounced duplicate request"
                    );
                    continue;
                }
                fresh.push(fp);
            }
            survivors.push(NewRequest::new(type_code, payload, now)?);
        }

        if survivors.is_empty() {
            return Ok(None);
        }

        let new_job = NewJob::new(pending.relation_id, pending.source_id, pending.store_id, now);
        let (job, requests) = self.store.insert_job_with_requests(new_job, survivors)?;

        // Only committed requests count as seen.
        for fp in fresh {
            self.history.record(fp);
        }

        debug!(
            job_id = %job.id,
            relation_id = ?job.relation_id,
            requests = requests.len(),
            "job created"
        );
        Ok(Some(job))
    }

    /// Build and commit a drafted job.
    pub fn create_from(&mut self, draft: JobDraft, debounce: bool) -> Result<Option<Job>, BuilderError> {
        self.new_job(draft.relation_id, draft.store_id, draft.source_id);
        for (type_code, payload) in draft.requests {
            self.add_request(payload, type_code)?;
        }
        self.create(debounce)
    }
}
