//! Watch-driven reconciliation of profiling resources.
//!
//! The controller watches `ProfilingRequest` and `ProfilingComparison`
//! resources and drives each towards a terminal phase:
//!
//! - **Dispatch**: a `Pending` resource without a job handle gets a backend
//!   job, chosen by algorithm class ([`strategy`])
//! - **Monitor**: a running job is polled until the backend confirms an
//!   outcome or the resource deadline passes ([`monitor`])
//! - **Status**: every write is a merge against a fresh read, retried on
//!   version conflicts ([`status`])
//! - **Cleanup**: deleting a resource cancels its backend jobs ([`cleanup`])
//!
//! Each resource identity is owned by one ractor actor, so work for one
//! identity is serialised while different identities proceed in parallel
//! under a shared concurrency bound.
//!
//! # Example
//!
//! ```ignore
//! use dprof_reconciler::{Controller, ReconcilerConfig};
//! use dprof_store::WatcherConfig;
//!
//! let controller = Controller::new(
//!     requests,
//!     comparisons,
//!     backends,
//!     ReconcilerConfig::default(),
//!     WatcherConfig::new("default"),
//! )?;
//! controller.run(shutdown_rx).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod actor;
pub mod cleanup;
pub mod comparison;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod reconcile;
pub mod request;
pub mod status;
pub mod strategy;

pub use actor::{ResourceActor, ResourceMessage, RetryPolicy};
pub use cleanup::CleanupHandler;
pub use comparison::{ComparisonMemory, ComparisonReconciler};
pub use config::ReconcilerConfig;
pub use controller::Controller;
pub use dispatcher::EventDispatcher;
pub use error::{Error, Result};
pub use monitor::{BarrierOutcome, CompletionMonitor, MonitorHandle, MonitorTarget, TargetOutcome};
pub use reconcile::{IdentityState, Reconcile};
pub use request::{RequestMemory, RequestReconciler};
pub use status::{StatusWriter, WriteOutcome};
pub use strategy::{
    BackendKind, CustomStrategy, DispatchStrategy, Dispatched, MlStrategy, SortingStrategy,
    Strategies,
};
