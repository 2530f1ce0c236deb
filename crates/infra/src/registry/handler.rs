//! Request handlers and their execution context.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::Span;

use loyaltysync_core::{Job, PREVIOUS_RESULT_KEY, Payload, Request, StoreId, payload};

use super::connector::{ApiClient, Connector};

/// Failure raised while executing a request.
///
/// The runner classifies these: `IllegalJob` is terminal, everything else is
/// retried under the backoff gate. `MissingDependency` is additionally a hint
/// for repair hooks.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The job should never have been created; resolve it without retrying.
    #[error("illegal job: {0}")]
    IllegalJob(String),
    /// An upstream entity this request depends on does not exist (yet).
    #[error("missing {kind} dependency: {detail}")]
    MissingDependency { kind: String, detail: String },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalJob(reason.into())
    }

    pub fn missing(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MissingDependency {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    pub fn failed(msg: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(msg))
    }

    pub fn is_illegal_job(&self) -> bool {
        matches!(self, Self::IllegalJob(_))
    }

    /// Message plus the full cause chain (and backtrace, when captured).
    pub fn detail(&self) -> String {
        match self {
            Self::Failed(err) => format!("{err:?}"),
            other => other.to_string(),
        }
    }
}

/// Request-scoped execution context handed to every handler method.
pub struct RequestContext<'a> {
    job: &'a Job,
    request: &'a Request,
    payload: Payload,
    connector: &'a dyn Connector,
}

impl<'a> RequestContext<'a> {
    pub fn new(job: &'a Job, request: &'a Request, payload: Payload, connector: &'a dyn Connector) -> Self {
        Self {
            job,
            request,
            payload,
            connector,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    /// Unpacked payload, including the previous result under the reserved key.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Payload without the reserved key (what the caller originally stored).
    pub fn arguments(&self) -> Payload {
        payload::with_previous_result(&self.payload, None)
    }

    pub fn previous_result(&self) -> Option<&JsonValue> {
        self.payload.get(PREVIOUS_RESULT_KEY)
    }

    pub fn store_id(&self) -> Option<StoreId> {
        self.job.store_id
    }

    /// String argument from the payload, falling back to the previous result.
    pub fn lookup_str(&self, key: &str) -> Option<String> {
        let from = |value: Option<&JsonValue>| -> Option<String> {
            match value? {
                JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        from(self.payload.get(key)).or_else(|| from(self.previous_result().and_then(|p| p.get(key))))
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector
    }

    /// Client for the job's store scope.
    pub fn connection(&self) -> Result<Arc<dyn ApiClient>, HandlerError> {
        self.connector
            .connection(self.store_id())
            .map_err(|e| HandlerError::Failed(anyhow::Error::new(e).context("connector unavailable")))
    }

    pub fn logger(&self, purpose: Option<&str>) -> Span {
        self.connector.logger(purpose)
    }
}

/// Executable behaviour bound to a type code.
///
/// Handlers are stateless; everything request-specific arrives through the
/// [`RequestContext`].
pub trait RequestHandler: Send + Sync {
    /// Name of the connector this handler requires.
    fn connector(&self) -> &str;

    /// Payload handed to the handler: the stored one plus the previous result.
    fn unpack(&self, request: &Request, previous: Option<&JsonValue>) -> Payload {
        payload::with_previous_result(&request.payload, previous)
    }

    fn before_execute(&self, _ctx: &RequestContext<'_>) -> Result<(), HandlerError> {
        Ok(())
    }

    fn execute(&self, ctx: &RequestContext<'_>) -> Result<JsonValue, HandlerError>;

    fn after_execute(&self, _ctx: &RequestContext<'_>, _result: &JsonValue) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Closure-backed handler.
pub struct FnHandler<F> {
    connector: String,
    execute: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&RequestContext<'_>) -> Result<JsonValue, HandlerError> + Send + Sync,
{
    pub fn new(connector: impl Into<String>, execute: F) -> Self {
        Self {
            connector: connector.into(),
            execute,
        }
    }
}

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&RequestContext<'_>) -> Result<JsonValue, HandlerError> + Send + Sync,
{
    fn connector(&self) -> &str {
        &self.connector
    }

    fn execute(&self, ctx: &RequestContext<'_>) -> Result<JsonValue, HandlerError> {
        (self.execute)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_includes_cause_chain() {
        let err = HandlerError::Failed(
            anyhow::anyhow!("socket closed").context("calling contacts.update"),
        );
        let detail = err.detail();
        assert!(detail.contains("calling contacts.update"));
        assert!(detail.contains("socket closed"));
    }

    #[test]
    fn classification_helpers() {
        assert!(HandlerError::illegal("gone").is_illegal_job());
        assert!(!HandlerError::missing("contact", "17").is_illegal_job());
        assert_eq!(
            HandlerError::missing("contact", "17").to_string(),
            "missing contact dependency: 17"
        );
    }
}
