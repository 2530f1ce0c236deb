//! Request type registry: type code -> handler -> connector.
//!
//! Built once at startup. Every handler's connector must be registered, so a
//! wiring mistake fails at build time instead of in the middle of a digest
//! cycle.

pub mod connector;
pub mod handler;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use loyaltysync_core::{Job, Request, TypeCode};

pub use connector::{ApiClient, ClientError, Connector, StaticConnector};
pub use handler::{FnHandler, HandlerError, RequestContext, RequestHandler};

/// Registry wiring error.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("no handler registered for type code '{0}'")]
    UnknownType(TypeCode),
    #[error("handler for '{type_code}' requires unknown connector '{connector}'")]
    UnknownConnector { type_code: TypeCode, connector: String },
    #[error("type code '{0}' registered twice")]
    DuplicateType(TypeCode),
    #[error("connector '{0}' registered twice")]
    DuplicateConnector(String),
}

/// Collects handlers and connectors; validated by [`RegistryBuilder::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<TypeCode, Arc<dyn RequestHandler>>,
    connectors: HashMap<String, Arc<dyn Connector>>,
    errors: Vec<RegistryError>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(self, connector: impl Connector + 'static) -> Self {
        self.connector_arc(Arc::new(connector))
    }

    pub fn connector_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        let name = connector.name().to_string();
        if self.connectors.insert(name.clone(), connector).is_some() {
            self.errors.push(RegistryError::DuplicateConnector(name));
        }
        self
    }

    pub fn handler(self, type_code: impl Into<TypeCode>, handler: impl RequestHandler + 'static) -> Self {
        self.handler_arc(type_code, Arc::new(handler))
    }

    pub fn handler_arc(mut self, type_code: impl Into<TypeCode>, handler: Arc<dyn RequestHandler>) -> Self {
        let type_code = type_code.into();
        if self.handlers.insert(type_code.clone(), handler).is_some() {
            self.errors.push(RegistryError::DuplicateType(type_code));
        }
        self
    }

    /// Register a closure as the handler for `type_code`.
    pub fn handler_fn<F>(self, type_code: impl Into<TypeCode>, connector: &str, execute: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> Result<JsonValue, HandlerError> + Send + Sync + 'static,
    {
        self.handler(type_code, FnHandler::new(connector, execute))
    }

    pub fn build(mut self) -> Result<RequestTypeRegistry, RegistryError> {
        if let Some(err) = self.errors.drain(..).next() {
            return Err(err);
        }

        let mut codes: Vec<&TypeCode> = self.handlers.keys().collect();
        codes.sort();
        for code in codes {
            let connector = self.handlers[code].connector();
            if !self.connectors.contains_key(connector) {
                return Err(RegistryError::UnknownConnector {
                    type_code: code.clone(),
                    connector: connector.to_string(),
                });
            }
        }

        Ok(RequestTypeRegistry {
            handlers: self.handlers,
            connectors: self.connectors,
        })
    }
}

/// Validated mapping from type codes to handlers and connectors.
pub struct RequestTypeRegistry {
    handlers: HashMap<TypeCode, Arc<dyn RequestHandler>>,
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl std::fmt::Debug for RequestTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().map(TypeCode::as_str).collect();
        codes.sort_unstable();
        let mut connectors: Vec<_> = self.connectors.keys().collect();
        connectors.sort_unstable();
        f.debug_struct("RequestTypeRegistry")
            .field("type_codes", &codes)
            .field("connectors", &connectors)
            .finish()
    }
}

impl RequestTypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn contains(&self, type_code: &TypeCode) -> bool {
        self.handlers.contains_key(type_code)
    }

    pub fn handler(&self, type_code: &TypeCode) -> Result<&Arc<dyn RequestHandler>, RegistryError> {
        self.handlers
            .get(type_code)
            .ok_or_else(|| RegistryError::UnknownType(type_code.clone()))
    }

    /// Connector required by the handler of `type_code`.
    pub fn connector_for(&self, type_code: &TypeCode) -> Result<&Arc<dyn Connector>, RegistryError> {
        let handler = self.handler(type_code)?;
        self.connectors
            .get(handler.connector())
            .ok_or_else(|| RegistryError::UnknownConnector {
                type_code: type_code.clone(),
                connector: handler.connector().to_string(),
            })
    }

    /// Execute one request: unpack, then before/execute/after.
    ///
    /// Handler errors are returned unchanged; wiring errors surface as
    /// [`HandlerError::Failed`].
    pub fn dispatch(
        &self,
        job: &Job,
        request: &Request,
        previous: Option<&JsonValue>,
    ) -> Result<JsonValue, HandlerError> {
        let handler = self
            .handler(&request.type_code)
            .map_err(|e| HandlerError::Failed(e.into()))?;
        let connector = self
            .connector_for(&request.type_code)
            .map_err(|e| HandlerError::Failed(e.into()))?;

        let span = connector.logger(Some(request.type_code.as_str()));
        let _enter = span.enter();

        let payload = handler.unpack(request, previous);
        let ctx = RequestContext::new(job, request, payload, &**connector);

        handler.before_execute(&ctx)?;
        let result = handler.execute(&ctx)?;
        handler.after_execute(&ctx, &result)?;

        debug!(
            job_id = %job.id,
            request_id = %request.id,
            type_code = %request.type_code,
            "request executed"
        );
        Ok(result)
    }
}
