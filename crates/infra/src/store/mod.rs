//! Job/request persistence.
//!
//! The runner and builder only talk to [`JobStore`]. The in-memory store backs
//! tests and dev setups; the Postgres store is available behind the
//! `postgres` feature.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStats, JobStore, StoreError};
