//! Infrastructure layer: job store, builder, request registry, digest runner,
//! loyalty handlers, cleanup and scheduling.

pub mod builder;
pub mod cleanup;
pub mod config;
pub mod digest;
pub mod handlers;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use builder::{BuilderError, DebounceHistory, JobBuilder, JobDraft};
pub use cleanup::JobCleanup;
pub use config::{CleanupConfig, ConfigError, DigestConfig, SchedulerConfig, WorkerConfig};
pub use digest::{DigestReport, JobDigest, JobOutcome, RunOptions};
pub use registry::{HandlerError, RegistryError, RequestTypeRegistry};
pub use scheduler::{DigestScheduler, DigestSchedulerHandle};
pub use store::{InMemoryJobStore, JobStats, JobStore, StoreError};

#[cfg(test)]
mod integration_tests;
