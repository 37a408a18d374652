//! dProfiler operator.
//!
//! Reads configuration, builds the HTTP stores and backend clients and runs
//! the reconciliation controller from `dprof-reconciler` until shutdown.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cli;
pub mod config;
pub mod operator;

pub use cli::{Cli, Commands};
pub use config::{ConfigError, OperatorConfig};
