//! `loyaltysync-core`: job/request model for the deferred sync engine.
//!
//! This crate contains **pure model** code (no storage, no IO). Persistence,
//! dispatch and the runner live in `loyaltysync-infra`.

pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod job;
pub mod payload;
pub mod request;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock, parse_timestamp};
pub use error::{DomainError, DomainResult};
pub use fingerprint::{Fingerprint, fingerprint};
pub use id::{JobId, RequestId, StoreId};
pub use job::{Job, NewJob};
pub use payload::{PREVIOUS_RESULT_KEY, Payload};
pub use request::{NewRequest, Request, TypeCode};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
