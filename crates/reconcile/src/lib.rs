//! # reconcile
//!
//! Idempotent create-or-update of Satellite entities over the
//! Foreman/Katello REST API.
//!
//! This crate provides:
//! - A search expression builder ([`Filter`])
//! - Lookup of remote tasks and waiting for the task queue to drain
//!   ([`TaskTracker`])
//! - A reconciliation loop that survives key conflicts, resource locks held
//!   by running tasks and server-side task timeouts ([`Reconciler`])
//!
//! ## Example
//!
//! ```no_run
//! use reconcile::{
//!     Connection, Entity, EntityKind, HttpBackend, OwnerScope, Reconciler, RetryPolicy,
//!     SystemClock,
//! };
//!
//! let backend = HttpBackend::new(&Connection {
//!     url: "https://satellite.example.com".into(),
//!     username: "admin".into(),
//!     password: "changeme".into(),
//!     verify_tls: true,
//! });
//! let reconciler = Reconciler::new(&backend, &SystemClock, RetryPolicy::default());
//!
//! let plan = Entity::named(EntityKind::SyncPlan, "daily-1")
//!     .with("interval", "daily")
//!     .owned_by(OwnerScope::Organization(1));
//! let result = reconciler.reconcile(&plan).expect("reconcile failed");
//! println!("{:?}", result.outcome);
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod clock;
pub mod error;
pub mod query;
pub mod reconciler;
pub mod retry;
pub mod tasks;
pub mod types;

#[cfg(test)]
mod testing;

pub use backend::{Backend, http::HttpBackend};
pub use clock::{Clock, SystemClock};
pub use error::{Error, ErrorCategory, Result};
pub use query::{Filter, FilterValue, Operator, SearchQuery};
pub use reconciler::{Outcome, Reconciler, Reconciliation};
pub use retry::{FailureKind, RetryPolicy, RetryState};
pub use tasks::TaskTracker;
pub use types::{
    Connection, DESCRIPTION_TAG, Endpoint, Entity, EntityKind, OwnerScope, Task, TaskResult,
    TaskState,
};
