//! Handlers for the loyalty platform: contacts and point transactions.
//!
//! All three talk to the connector named [`LOYALTY_CONNECTOR`]. Upstream
//! errors are classified as follows:
//!
//! | upstream                        | handler error                           |
//! |---------------------------------|-----------------------------------------|
//! | no contact for the customer     | `MissingDependency { kind: "contact" }` |
//! | `NotFound` for a known id       | `Failed` (retried)                      |
//! | `Rejected`                      | `IllegalJob`                            |
//! | `Transport`                     | `Failed` (retried)                      |
//!
//! Only a customer without any contact is repairable: a `contact.create` for
//! the relation cannot fix an id that the payload or a previous request
//! already pinned.

use anyhow::Context as _;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use loyaltysync_core::{Payload, TypeCode};

use crate::builder::JobDraft;
use crate::digest::{FailureHook, FailureReaction, RequestFailure};
use crate::registry::{ClientError, HandlerError, RegistryBuilder, RequestContext, RequestHandler};

/// Connector name the loyalty handlers require.
pub const LOYALTY_CONNECTOR: &str = "loyalty";

/// Dependency kind raised when the upstream contact is missing.
pub const CONTACT_DEPENDENCY: &str = "contact";

const CONTACT_ID: &str = "contact_id";
const CUSTOMER_ID: &str = "customer_id";

/// Register the loyalty handlers under their well-known type codes.
///
/// The caller still has to register a connector named [`LOYALTY_CONNECTOR`].
pub fn register_loyalty_handlers(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .handler(TypeCode::CONTACT_CREATE, CreateContactHandler)
        .handler(TypeCode::CONTACT_UPDATE, UpdateContactHandler)
        .handler(TypeCode::TRANSACTION_RECORD, RecordTransactionHandler)
}

fn call(ctx: &RequestContext<'_>, operation: &str, body: JsonValue) -> Result<JsonValue, ClientError> {
    let client = ctx.connection().map_err(|e| ClientError::Transport(e.detail()))?;
    let span = ctx.logger(Some(operation));
    let _enter = span.enter();
    debug!(operation, "calling loyalty api");
    client.call(operation, &body)
}

fn classify(err: ClientError, operation: &str) -> HandlerError {
    match err {
        ClientError::NotFound(what) => {
            HandlerError::Failed(anyhow::anyhow!("not found: {what}").context(operation.to_string()))
        }
        ClientError::Rejected(reason) => HandlerError::illegal(format!("{operation} rejected: {reason}")),
        other @ ClientError::Transport(_) => {
            HandlerError::Failed(anyhow::Error::new(other).context(format!("calling {operation}")))
        }
    }
}

/// Contact id from the payload or previous result, else looked up by customer.
fn contact_id(ctx: &RequestContext<'_>) -> Result<String, HandlerError> {
    if let Some(id) = ctx.lookup_str(CONTACT_ID) {
        return Ok(id);
    }

    let customer = ctx
        .lookup_str(CUSTOMER_ID)
        .or_else(|| ctx.job().relation_id.clone())
        .ok_or_else(|| HandlerError::missing(CONTACT_DEPENDENCY, "no contact id and no customer"))?;

    let response = match call(ctx, "contacts.lookup", json!({ CUSTOMER_ID: customer })) {
        Ok(response) => response,
        Err(ClientError::NotFound(_)) => {
            return Err(HandlerError::missing(
                CONTACT_DEPENDENCY,
                format!("no contact for customer {customer}"),
            ));
        }
        Err(e) => return Err(classify(e, "contacts.lookup")),
    };

    match response.get(CONTACT_ID) {
        Some(JsonValue::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        _ => Err(HandlerError::missing(
            CONTACT_DEPENDENCY,
            format!("no contact for customer {customer}"),
        )),
    }
}

fn body_with(ctx: &RequestContext<'_>, key: &str, value: String) -> JsonValue {
    let mut body = ctx.arguments();
    body.insert(key.to_string(), JsonValue::String(value));
    JsonValue::Object(body)
}

/// `contact.create`: creates the upstream contact for a customer.
///
/// The customer id defaults to the job's relation id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateContactHandler;

impl RequestHandler for CreateContactHandler {
    fn connector(&self) -> &str {
        LOYALTY_CONNECTOR
    }

    fn before_execute(&self, ctx: &RequestContext<'_>) -> Result<(), HandlerError> {
        if ctx.lookup_str(CUSTOMER_ID).is_none() && ctx.job().relation_id.is_none() {
            return Err(HandlerError::illegal("contact.create without customer"));
        }
        Ok(())
    }

    fn execute(&self, ctx: &RequestContext<'_>) -> Result<JsonValue, HandlerError> {
        let customer = ctx
            .lookup_str(CUSTOMER_ID)
            .or_else(|| ctx.job().relation_id.clone())
            .unwrap_or_default();
        let body = body_with(ctx, CUSTOMER_ID, customer);
        call(ctx, "contacts.create", body).map_err(|e| classify(e, "contacts.create"))
    }

    fn after_execute(&self, ctx: &RequestContext<'_>, result: &JsonValue) -> Result<(), HandlerError> {
        match result.get(CONTACT_ID) {
            Some(JsonValue::String(id)) if !id.is_empty() => {
                info!(contact_id = %id, relation_id = ?ctx.job().relation_id, "contact created");
                Ok(())
            }
            Some(JsonValue::Number(_)) => Ok(()),
            _ => Err(HandlerError::failed("contacts.create response has no contact_id")),
        }
    }
}

/// `contact.update`: pushes changed customer fields to an existing contact.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateContactHandler;

impl RequestHandler for UpdateContactHandler {
    fn connector(&self) -> &str {
        LOYALTY_CONNECTOR
    }

    fn execute(&self, ctx: &RequestContext<'_>) -> Result<JsonValue, HandlerError> {
        let id = contact_id(ctx)?;
        let body = body_with(ctx, CONTACT_ID, id.clone());
        let response = call(ctx, "contacts.update", body).map_err(|e| classify(e, "contacts.update"))?;

        // Keep the contact id flowing to later requests of the job.
        Ok(match response {
            JsonValue::Object(mut map) => {
                map.entry(CONTACT_ID).or_insert(JsonValue::String(id));
                JsonValue::Object(map)
            }
            _ => json!({ CONTACT_ID: id }),
        })
    }
}

/// `transaction.record`: books a points transaction on a contact.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordTransactionHandler;

impl RecordTransactionHandler {
    fn points(ctx: &RequestContext<'_>) -> Result<i64, HandlerError> {
        let raw = ctx
            .payload()
            .get("points")
            .ok_or_else(|| HandlerError::illegal("transaction without points"))?;
        let points = raw
            .as_i64()
            .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| HandlerError::illegal(format!("transaction points not an integer: {raw}")))?;
        if points == 0 {
            return Err(HandlerError::illegal("transaction of zero points"));
        }
        Ok(points)
    }
}

impl RequestHandler for RecordTransactionHandler {
    fn connector(&self) -> &str {
        LOYALTY_CONNECTOR
    }

    fn before_execute(&self, ctx: &RequestContext<'_>) -> Result<(), HandlerError> {
        Self::points(ctx).map(|_| ())
    }

    fn execute(&self, ctx: &RequestContext<'_>) -> Result<JsonValue, HandlerError> {
        let id = contact_id(ctx)?;
        let points = Self::points(ctx)?;
        let mut body = ctx.arguments();
        body.insert(CONTACT_ID.to_string(), JsonValue::String(id.clone()));
        body.insert("points".to_string(), JsonValue::from(points));

        call(ctx, "transactions.record", JsonValue::Object(body))
            .map_err(|e| classify(e, "transactions.record"))
            .and_then(|response| {
                response
                    .get("transaction_id")
                    .cloned()
                    .map(|tx| json!({ CONTACT_ID: id, "transaction_id": tx }))
                    .context("transactions.record response has no transaction_id")
                    .map_err(HandlerError::from)
            })
    }
}

/// Failure hook: when a contact is missing upstream, create it.
///
/// Drafts a `contact.create` job for the failed job's relation and store; the
/// runner creates and runs it right away. Jobs without a relation are left
/// alone.
#[derive(Debug, Clone, Default)]
pub struct ContactRepair {
    extra: Payload,
}

impl ContactRepair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra payload fields for the drafted `contact.create` request.
    pub fn with_payload(mut self, extra: Payload) -> Self {
        self.extra = extra;
        self
    }

    fn draft(&self, failure: &RequestFailure<'_>) -> Option<JobDraft> {
        let relation = failure.job.relation_id.clone()?;
        let mut payload = self.extra.clone();
        payload.insert(CUSTOMER_ID.to_string(), JsonValue::String(relation.clone()));
        Some(
            JobDraft::new(Some(relation), failure.job.store_id)
                .with_request(TypeCode::CONTACT_CREATE, payload),
        )
    }
}

impl FailureHook for ContactRepair {
    fn on_failure(&self, failure: &RequestFailure<'_>) -> FailureReaction {
        match failure.error {
            HandlerError::MissingDependency { kind, .. } if kind == CONTACT_DEPENDENCY => self
                .draft(failure)
                .map(FailureReaction::Repair)
                .unwrap_or(FailureReaction::Pass),
            _ => FailureReaction::Pass,
        }
    }
}
