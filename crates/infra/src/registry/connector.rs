//! Connectors: named bindings to an upstream service.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::Span;

use loyaltysync_core::StoreId;

/// Upstream client error.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The referenced upstream entity does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The upstream refused the call for a business reason
    #[error("rejected: {0}")]
    Rejected(String),
    /// Network/protocol failure; worth retrying
    #[error("transport error: {0}")]
    Transport(String),
}

/// Minimal upstream API surface used by handlers.
pub trait ApiClient: Send + Sync {
    fn call(&self, operation: &str, body: &JsonValue) -> Result<JsonValue, ClientError>;
}

/// Named binding to an external service.
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Client for the given store scope.
    fn connection(&self, store_id: Option<StoreId>) -> Result<Arc<dyn ApiClient>, ClientError>;

    /// Logging span for work done through this connector.
    fn logger(&self, purpose: Option<&str>) -> Span {
        tracing::info_span!(
            "connector",
            connector = self.name(),
            purpose = purpose.unwrap_or("default")
        )
    }
}

/// Connector with a fixed client per store and an optional fallback.
pub struct StaticConnector {
    name: String,
    default: Option<Arc<dyn ApiClient>>,
    per_store: HashMap<StoreId, Arc<dyn ApiClient>>,
}

impl StaticConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            per_store: HashMap::new(),
        }
    }

    pub fn with_default(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.default = Some(client);
        self
    }

    pub fn with_store(mut self, store_id: StoreId, client: Arc<dyn ApiClient>) -> Self {
        self.per_store.insert(store_id, client);
        self
    }
}

impl std::fmt::Debug for StaticConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticConnector")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .field("stores", &self.per_store.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Connector for StaticConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self, store_id: Option<StoreId>) -> Result<Arc<dyn ApiClient>, ClientError> {
        store_id
            .and_then(|id| self.per_store.get(&id))
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| {
                ClientError::Transport(format!(
                    "connector '{}' has no client for store {:?}",
                    self.name, store_id
                ))
            })
    }
}
