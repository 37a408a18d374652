//! Declarative profiling resources.
//!
//! This crate defines the two resource kinds the operator reconciles and the
//! rules for updating their status:
//!
//! - **`ProfilingRequest`**: a single algorithm run (served as `AlgorithmProfiling`)
//! - **`ProfilingComparison`**: N algorithms over a shared input size
//!   (served as `AlgorithmComparison`)
//! - **Status merge**: phase monotonicity, write-once job handles and
//!   append-only conditions, expressed as pure functions
//!
//! # Example
//!
//! ```ignore
//! use dprof_resources::{Merge, MergeStatus, ProfilingRequest, ResourceObject, StatusUpdate};
//!
//! let request: ProfilingRequest = serde_json::from_str(manifest)?;
//! let status = request.status().cloned().unwrap_or_default();
//! let update = StatusUpdate::dispatched(handle, chrono::Utc::now());
//! match status.merge(&update) {
//!     Merge::Changed(next) => { /* write next */ }
//!     Merge::Unchanged | Merge::Rejected(_) => {}
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod comparison;
pub mod duration;
pub mod error;
pub mod meta;
pub mod request;
pub mod status;
pub mod types;

pub use comparison::{
    ComparisonEntry, ComparisonResult, ComparisonSpec, ComparisonStatus, ComparisonUpdate,
    ProfilingComparison, SubJobStatus,
};
pub use duration::ProfilingTimeout;
pub use error::{Error, Result};
pub use meta::{API_GROUP, API_VERSION, ObjectMeta, ResourceKey, ResourceObject};
pub use request::{ProfilingRequest, ProfilingRequestSpec, ProfilingStatus};
pub use status::{CoreUpdate, Merge, MergeStatus, RejectReason, StatusCore, StatusUpdate};
pub use types::{
    AlgorithmClass, Condition, ConditionReason, ConditionStatus, CustomConfig, EnvVar, Feature,
    JobHandle, MlConfig, MlFramework, MlResults, MlTask, Phase, ProfilingResults,
    ResourceRequirements,
};
