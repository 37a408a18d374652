//! Execution backends.
//!
//! The controller talks to three external services, each behind an async
//! trait with an HTTP client and an in-memory fake:
//!
//! - **`ProfilingService`**: asynchronous jobs for built-in algorithms
//! - **`MlService`**: synchronous ML tasks that answer with final metrics
//! - **`ComputeCluster`**: native batch jobs for arbitrary containers

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;

pub mod cluster;
pub mod config;
pub mod error;
pub mod memory;
pub mod ml;
pub mod profiling;

pub use cluster::{BatchJobSpec, BatchJobStatus, ComputeCluster, HttpComputeCluster};
pub use config::{DEFAULT_API_URL, DEFAULT_CLUSTER_URL, DEFAULT_REQUEST_TIMEOUT, EndpointConfig};
pub use error::{Error, Result};
pub use memory::{InMemoryComputeCluster, InMemoryMlService, InMemoryProfilingService, JobScript};
pub use ml::{HttpMlService, MlOutcome, MlRequest, MlService};
pub use profiling::{HttpProfilingService, JobProgress, JobRequest, ProfilingService};

/// The set of backends a controller dispatches to.
#[derive(Clone)]
pub struct Backends {
    pub profiling: Arc<dyn ProfilingService>,
    pub ml: Arc<dyn MlService>,
    pub cluster: Arc<dyn ComputeCluster>,
}

impl Backends {
    /// Bundle three backends.
    pub fn new(
        profiling: Arc<dyn ProfilingService>,
        ml: Arc<dyn MlService>,
        cluster: Arc<dyn ComputeCluster>,
    ) -> Self {
        Self {
            profiling,
            ml,
            cluster,
        }
    }

    /// HTTP clients for all three backends.
    pub fn http(
        profiling: EndpointConfig,
        ml: EndpointConfig,
        cluster: EndpointConfig,
        namespace: &str,
    ) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpProfilingService::new(profiling)?),
            Arc::new(HttpMlService::new(ml)?),
            Arc::new(HttpComputeCluster::new(cluster, namespace)?),
        ))
    }
}
