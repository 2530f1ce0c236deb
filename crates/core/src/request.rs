//! Requests: the ordered steps of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, RequestId};
use crate::payload::{self, Payload};

/// Type code selecting the handler for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeCode(String);

impl TypeCode {
    /// Create a loyalty contact upstream.
    pub const CONTACT_CREATE: &'static str = "contact.create";
    /// Update an existing loyalty contact.
    pub const CONTACT_UPDATE: &'static str = "contact.update";
    /// Record a credit/points transaction against a contact.
    pub const TRANSACTION_RECORD: &'static str = "transaction.record";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Validate and build a type code (non-empty, no surrounding whitespace).
    pub fn parse(code: &str) -> DomainResult<Self> {
        if code.is_empty() || code.trim() != code {
            return Err(DomainError::validation(format!("invalid type code '{code}'")));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is(&self, code: &str) -> bool {
        self.0 == code
    }
}

impl core::fmt::Display for TypeCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A persisted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub job_id: JobId,
    pub type_code: TypeCode,
    pub payload: Payload,
    /// True once the request executed successfully; never re-executed after
    pub is_synced: bool,
    /// Incremented before each execution try
    pub attempt: u32,
    pub latest_fail_reason: Option<String>,
    /// Last successful handler output
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Attempts already made before the current one.
    ///
    /// `attempt` is bumped before each try, so this is `attempt - 1` and may be
    /// negative for a request that has never run.
    pub fn effective_attempt(&self) -> i64 {
        i64::from(self.attempt) - 1
    }

    /// Count a new execution try.
    pub fn begin_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Record a successful execution.
    pub fn mark_synced(&mut self, result: JsonValue, now: DateTime<Utc>) {
        self.is_synced = true;
        self.result = Some(result);
        self.updated_at = now;
    }

    /// Record a failed execution; the request stays eligible for retry.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.is_synced = false;
        self.latest_fail_reason = Some(reason.into());
        self.updated_at = now;
    }

    /// Resolve the request without a result (illegal-job outcome).
    pub fn mark_ignored(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.is_synced = true;
        self.latest_fail_reason = Some(reason.into());
        self.updated_at = now;
    }

    /// Operator intervention: make a stuck request retryable again.
    pub fn reset_attempts(&mut self, now: DateTime<Utc>) {
        self.attempt = 0;
        self.updated_at = now;
    }
}

/// A request that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub type_code: TypeCode,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl NewRequest {
    pub fn new(type_code: TypeCode, payload: Payload, created_at: DateTime<Utc>) -> DomainResult<Self> {
        payload::check_reserved(&payload)?;
        Ok(Self {
            type_code,
            payload,
            created_at,
        })
    }

    /// Attach the store-assigned id and owning job.
    pub fn into_request(self, id: RequestId, job_id: JobId) -> Request {
        Request {
            id,
            job_id,
            type_code: self.type_code,
            payload: self.payload,
            is_synced: false,
            attempt: 0,
            latest_fail_reason: None,
            result: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Request {
        NewRequest::new(TypeCode::new(TypeCode::CONTACT_CREATE), Payload::new(), Utc::now())
            .unwrap()
            .into_request(RequestId::new(1), JobId::new(1))
    }

    #[test]
    fn type_code_validation() {
        assert!(TypeCode::parse("contact.create").is_ok());
        assert!(TypeCode::parse("").is_err());
        assert!(TypeCode::parse(" contact.create").is_err());
        assert!(TypeCode::new(TypeCode::CONTACT_CREATE).is(TypeCode::CONTACT_CREATE));
    }

    #[test]
    fn new_request_rejects_reserved_key() {
        let mut payload = Payload::new();
        payload.insert(crate::PREVIOUS_RESULT_KEY.into(), json!(1));
        assert!(NewRequest::new(TypeCode::new("x"), payload, Utc::now()).is_err());
    }

    #[test]
    fn attempt_lifecycle() {
        let mut r = request();
        assert_eq!(r.attempt, 0);
        assert_eq!(r.effective_attempt(), -1);

        r.begin_attempt();
        r.mark_failed("boom", Utc::now());
        assert_eq!(r.attempt, 1);
        assert!(!r.is_synced);
        assert_eq!(r.latest_fail_reason.as_deref(), Some("boom"));

        r.begin_attempt();
        r.mark_synced(json!({"id": 9}), Utc::now());
        assert!(r.is_synced);
        assert_eq!(r.result, Some(json!({"id": 9})));
        assert_eq!(r.effective_attempt(), 1);
    }

    #[test]
    fn ignored_request_is_synced_without_result() {
        let mut r = request();
        r.begin_attempt();
        r.mark_ignored("customer deleted", Utc::now());
        assert!(r.is_synced);
        assert!(r.result.is_none());
        assert_eq!(r.latest_fail_reason.as_deref(), Some("customer deleted"));
    }
}
