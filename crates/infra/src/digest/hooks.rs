//! Extension points of the digest runner.
//!
//! - [`FailureHook`]: runs after the default failure handling, in registration
//!   order, and may ask the runner to create and immediately run a corrective
//!   job.
//! - [`ValidationOverride`]: lets a job through the parent-dependency gate.

use loyaltysync_core::{Job, Request, TypeCode};

use crate::builder::JobDraft;
use crate::registry::HandlerError;

/// A failed request, as seen by failure hooks.
///
/// `request` already carries the default handling (fail reason, sync flag).
#[derive(Debug)]
pub struct RequestFailure<'a> {
    pub job: &'a Job,
    pub request: &'a Request,
    pub error: &'a HandlerError,
}

/// What a failure hook wants the runner to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReaction {
    /// Not interested; ask the next hook.
    Pass,
    /// Handled; skip the remaining hooks.
    Stop,
    /// Create this job and run it right away, then skip the remaining hooks.
    Repair(JobDraft),
}

/// Reaction to a failed request.
pub trait FailureHook: Send + Sync {
    fn on_failure(&self, failure: &RequestFailure<'_>) -> FailureReaction;
}

impl<F> FailureHook for F
where
    F: Fn(&RequestFailure<'_>) -> FailureReaction + Send + Sync,
{
    fn on_failure(&self, failure: &RequestFailure<'_>) -> FailureReaction {
        self(failure)
    }
}

/// Forces a job through the parent-dependency gate.
pub trait ValidationOverride: Send + Sync {
    fn force_valid(&self, job: &Job, requests: &[Request]) -> bool;
}

/// Lets a job run despite an open parent when it still has an unsynced
/// request of one of the given types.
///
/// Registered with `contact.create`: running that request is what resolves
/// the dependency the gate is waiting for.
#[derive(Debug, Clone)]
pub struct PendingTypeOverride {
    type_codes: Vec<TypeCode>,
}

impl PendingTypeOverride {
    pub fn new<I, T>(type_codes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeCode>,
    {
        Self {
            type_codes: type_codes.into_iter().map(Into::into).collect(),
        }
    }

    /// The contact-create special case.
    pub fn contact_create() -> Self {
        Self::new([TypeCode::CONTACT_CREATE])
    }
}

impl ValidationOverride for PendingTypeOverride {
    fn force_valid(&self, _job: &Job, requests: &[Request]) -> bool {
        requests
            .iter()
            .any(|r| !r.is_synced && self.type_codes.contains(&r.type_code))
    }
}

/// Repairs a `MissingDependency` of one kind by drafting a corrective job.
pub struct DependencyRepair<F> {
    kind: String,
    draft: F,
}

impl<F> DependencyRepair<F>
where
    F: Fn(&RequestFailure<'_>) -> Option<JobDraft> + Send + Sync,
{
    pub fn new(kind: impl Into<String>, draft: F) -> Self {
        Self {
            kind: kind.into(),
            draft,
        }
    }
}

impl<F> FailureHook for DependencyRepair<F>
where
    F: Fn(&RequestFailure<'_>) -> Option<JobDraft> + Send + Sync,
{
    fn on_failure(&self, failure: &RequestFailure<'_>) -> FailureReaction {
        match failure.error {
            HandlerError::MissingDependency { kind, .. } if *kind == self.kind => {
                match (self.draft)(failure) {
                    Some(draft) => FailureReaction::Repair(draft),
                    None => FailureReaction::Pass,
                }
            }
            _ => FailureReaction::Pass,
        }
    }
}
