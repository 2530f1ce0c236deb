//! End-to-end scenarios: builder → store → digest → loyalty handlers.
//!
//! Verifies:
//! - Debounced triggers produce a single job
//! - A missing upstream contact is repaired within the same cycle
//! - A failing repair is retried, never duplicated
//! - Results chain from `contact.update` into `transaction.record`
//! - Completed jobs are removed after the retention window

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use serde_json::{Value as JsonValue, json};

use loyaltysync_core::{Clock, ManualClock, Payload, StoreId, TypeCode, payload};

use crate::builder::JobBuilder;
use crate::cleanup::JobCleanup;
use crate::config::{CleanupConfig, DigestConfig};
use crate::digest::{JobDigest, JobOutcome, PendingTypeOverride, RunOptions};
use crate::handlers::{ContactRepair, LOYALTY_CONNECTOR, register_loyalty_handlers};
use crate::registry::{ApiClient, ClientError, RequestTypeRegistry, StaticConnector};
use crate::store::{InMemoryJobStore, JobStore};

/// Loyalty platform double with real contact state.
#[derive(Default)]
struct LoyaltyPlatform {
    contacts: Mutex<HashMap<String, String>>,
    ledger: Mutex<Vec<(String, i64)>>,
    calls: Mutex<Vec<String>>,
    /// `contacts.create` fails with a transport error while set.
    create_outage: AtomicBool,
}

impl LoyaltyPlatform {
    fn ledger(&self) -> Vec<(String, i64)> {
        self.ledger.lock().unwrap().clone()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| *c == operation).count()
    }

    fn contact_for(&self, customer: &str) -> Option<String> {
        self.contacts.lock().unwrap().get(customer).cloned()
    }
}

fn field<'a>(body: &'a JsonValue, key: &str) -> Result<&'a str, ClientError> {
    body.get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ClientError::Rejected(format!("{key} required")))
}

impl ApiClient for LoyaltyPlatform {
    fn call(&self, operation: &str, body: &JsonValue) -> Result<JsonValue, ClientError> {
        self.calls.lock().unwrap().push(operation.to_string());
        match operation {
            "contacts.create" => {
                if self.create_outage.load(Ordering::SeqCst) {
                    return Err(ClientError::Transport("503 service unavailable".into()));
                }
                let customer = field(body, "customer_id")?;
                let mut contacts = self.contacts.lock().unwrap();
                let next = format!("C-{}", contacts.len() + 1);
                let id = contacts.entry(customer.to_string()).or_insert(next).clone();
                Ok(json!({ "contact_id": id }))
            }
            "contacts.lookup" => {
                let customer = field(body, "customer_id")?;
                self.contact_for(customer)
                    .map(|id| json!({ "contact_id": id }))
                    .ok_or_else(|| ClientError::NotFound(format!("customer {customer}")))
            }
            "contacts.update" => {
                let contact = field(body, "contact_id")?;
                if self.contacts.lock().unwrap().values().any(|c| c == contact) {
                    Ok(json!({ "updated": true }))
                } else {
                    Err(ClientError::NotFound(format!("contact {contact}")))
                }
            }
            "transactions.record" => {
                let contact = field(body, "contact_id")?.to_string();
                let points = body
                    .get("points")
                    .and_then(JsonValue::as_i64)
                    .ok_or_else(|| ClientError::Rejected("points required".into()))?;
                let mut ledger = self.ledger.lock().unwrap();
                ledger.push((contact, points));
                Ok(json!({ "transaction_id": ledger.len() }))
            }
            other => Err(ClientError::Transport(format!("unknown operation {other}"))),
        }
    }
}

struct Harness {
    store: Arc<InMemoryJobStore>,
    platform: Arc<LoyaltyPlatform>,
    clock: Arc<ManualClock>,
    digest: JobDigest<Arc<InMemoryJobStore>>,
}

fn harness() -> Harness {
    let store = InMemoryJobStore::arc();
    let platform = Arc::new(LoyaltyPlatform::default());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()));

    let registry = register_loyalty_handlers(RequestTypeRegistry::builder())
        .connector(StaticConnector::new(LOYALTY_CONNECTOR).with_default(platform.clone()))
        .build()
        .unwrap();

    let digest = JobDigest::new(store.clone(), Arc::new(registry), clock.clone())
        .with_config(DigestConfig::default())
        .on_failure(ContactRepair::new())
        .with_validation_override(PendingTypeOverride::contact_create());

    Harness {
        store,
        platform,
        clock,
        digest,
    }
}

fn body(value: JsonValue) -> Payload {
    payload::from_value(value).unwrap()
}

/// What a "customer saved" observer would enqueue.
fn customer_saved(builder: &mut JobBuilder<Arc<InMemoryJobStore>>, customer: &str, points: i64) -> Option<loyaltysync_core::Job> {
    builder.new_job(Some(customer.to_string()), Some(StoreId::new(1)), Some("customer".into()));
    builder
        .add_request(body(json!({"name": "Ada"})), TypeCode::new(TypeCode::CONTACT_UPDATE))
        .unwrap()
        .add_request(body(json!({"points": points})), TypeCode::new(TypeCode::TRANSACTION_RECORD))
        .unwrap();
    builder.create(true).unwrap()
}

#[test]
fn missing_contact_is_repaired_and_job_completes() {
    let h = harness();
    let mut builder = JobBuilder::new(h.store.clone(), h.clock.clone());

    let job = customer_saved(&mut builder, "17", 50).unwrap();
    // The same save observed twice only enqueues once.
    assert!(customer_saved(&mut builder, "17", 50).is_none());
    assert_eq!(h.store.job_count(), 1);

    let first = h.digest.run().unwrap();
    assert_eq!(first.repairs_spawned, 1);
    assert_eq!(first.jobs_failed, 1);
    assert_eq!(h.platform.contact_for("17").as_deref(), Some("C-1"));
    assert!(h.platform.ledger().is_empty());

    let second = h.digest.run().unwrap();
    assert_eq!(second.jobs_selected, 1);
    assert_eq!(second.jobs_completed, 1);
    assert_eq!(h.platform.ledger(), vec![("C-1".to_string(), 50)]);

    let requests = h.store.requests_for(job.id).unwrap();
    assert!(requests.iter().all(|r| r.is_synced));
    assert_eq!(requests[0].attempt, 2);
    assert_eq!(requests[1].attempt, 1);
    assert_eq!(
        requests[1].result,
        Some(json!({"contact_id": "C-1", "transaction_id": 1}))
    );
}

#[test]
fn failing_repair_is_retried_not_duplicated() {
    let h = harness();
    h.platform.create_outage.store(true, Ordering::SeqCst);

    let mut builder = JobBuilder::new(h.store.clone(), h.clock.clone());
    let job = customer_saved(&mut builder, "17", 50).unwrap();

    for _ in 0..5 {
        h.digest.run().unwrap();
        h.clock.advance(chrono::Duration::hours(20));
    }
    // The original job plus a single corrective job, retried once per cycle.
    assert_eq!(h.store.job_count(), 2);
    assert_eq!(h.platform.count("contacts.create"), 5);
    assert_eq!(h.store.stats(8).unwrap().open_jobs, 2);

    h.platform.create_outage.store(false, Ordering::SeqCst);
    for _ in 0..2 {
        h.digest.run().unwrap();
        h.clock.advance(chrono::Duration::hours(20));
    }
    assert_eq!(h.store.stats(8).unwrap().open_jobs, 0);
    assert!(h.store.get_job(job.id).unwrap().unwrap().completed);
    assert_eq!(h.platform.count("contacts.create"), 6);
    assert_eq!(h.platform.ledger(), vec![("C-1".to_string(), 50)]);
}

#[test]
fn existing_contact_runs_immediately_after_creation() {
    let h = harness();
    h.platform
        .contacts
        .lock()
        .unwrap()
        .insert("42".to_string(), "C-42".to_string());

    let mut builder = JobBuilder::new(h.store.clone(), h.clock.clone());
    let job = customer_saved(&mut builder, "42", -10).unwrap();

    let outcome = h.digest.run_job(job.id, RunOptions::immediate()).unwrap();
    assert_eq!(outcome, JobOutcome::Completed { executed: 2 });
    assert_eq!(h.platform.ledger(), vec![("C-42".to_string(), -10)]);
    assert_eq!(
        h.platform.calls(),
        vec!["contacts.lookup", "contacts.update", "transactions.record"]
    );
    assert_eq!(h.digest.run().unwrap().jobs_selected, 0);
}

#[test]
fn illegal_transaction_does_not_block_later_jobs_for_the_customer() {
    let h = harness();
    h.platform
        .contacts
        .lock()
        .unwrap()
        .insert("7".to_string(), "C-7".to_string());

    let mut builder = JobBuilder::new(h.store.clone(), h.clock.clone());
    let zero = customer_saved(&mut builder, "7", 0).unwrap();
    let later = customer_saved(&mut builder, "7", 5).unwrap();

    let report = h.digest.run().unwrap();
    assert_eq!(report.jobs_illegal, 1);
    assert_eq!(report.jobs_completed, 1);

    let zero_requests = h.store.requests_for(zero.id).unwrap();
    assert!(zero_requests[1].is_synced);
    assert_eq!(
        zero_requests[1].latest_fail_reason.as_deref(),
        Some("transaction of zero points")
    );
    assert!(h.store.get_job(later.id).unwrap().unwrap().completed);
    assert_eq!(h.platform.ledger(), vec![("C-7".to_string(), 5)]);
}

#[test]
fn completed_jobs_expire_after_retention() {
    let h = harness();
    h.platform
        .contacts
        .lock()
        .unwrap()
        .insert("3".to_string(), "C-3".to_string());

    let mut builder = JobBuilder::new(h.store.clone(), h.clock.clone());
    customer_saved(&mut builder, "3", 1).unwrap();
    h.digest.run().unwrap();

    let cleanup = JobCleanup::new(CleanupConfig::default());
    h.clock.advance(chrono::Duration::days(29));
    assert_eq!(cleanup.run(&*h.store, h.clock.now()).unwrap(), 0);

    h.clock.advance(chrono::Duration::days(2));
    assert_eq!(cleanup.run(&*h.store, h.clock.now()).unwrap(), 1);
    assert_eq!(h.store.job_count(), 0);
    assert_eq!(h.store.stats(8).unwrap().pending_requests, 0);
}
