//! Declarative resource store.
//!
//! Provides the store abstraction the controller reconciles against:
//!
//! - **`ResourceStore`**: list, resumable watch, get, create, status patch
//!   with optimistic concurrency, delete
//! - **`InMemoryResourceStore`**: versioned in-process store with bounded
//!   watch history and fault-injection hooks for tests
//! - **`HttpResourceStore`**: client for a Kubernetes-compatible API server
//! - **`ResourceWatcher`**: turns the fallible watch protocol into an endless
//!   ordered event sequence with bookmark resumption and re-list fallback

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod http;
pub mod memory;
pub mod store;
pub mod watcher;

pub use error::{Error, Result};
pub use http::{HttpResourceStore, HttpStoreConfig};
pub use memory::{DEFAULT_HISTORY_LIMIT, InMemoryResourceStore};
pub use store::{EventKind, ResourceList, ResourceStore, StreamItem, WatchEvent, WatchStream};
pub use watcher::{ResourceWatcher, WatcherConfig, calculate_backoff};
