//! Dispatch strategies: one per algorithm class.
//!
//! A strategy turns a request spec into a backend job. Asynchronous
//! backends answer with a handle the completion monitor polls; the ML
//! Service answers with final results straight away.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use dprof_backends::{
    Backends, BatchJobSpec, ComputeCluster, JobRequest, MlRequest, MlService, ProfilingService,
};
use dprof_resources::{
    AlgorithmClass, CustomConfig, JobHandle, MlConfig, ProfilingRequestSpec, ProfilingResults,
};

use crate::error::{Error, Result};

/// Backend that owns a job handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Profiling,
    Ml,
    Cluster,
}

impl BackendKind {
    /// Backend serving an algorithm class.
    pub const fn for_class(class: AlgorithmClass) -> Self {
        match class {
            AlgorithmClass::Sorting => Self::Profiling,
            AlgorithmClass::Ml => Self::Ml,
            AlgorithmClass::Custom => Self::Cluster,
        }
    }

    /// Check if jobs on this backend keep state that needs deleting.
    pub const fn needs_cleanup(self) -> bool {
        !matches!(self, Self::Ml)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Profiling => write!(f, "profiling-service"),
            Self::Ml => write!(f, "ml-service"),
            Self::Cluster => write!(f, "compute-cluster"),
        }
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// A job is running and must be monitored.
    Async { handle: JobHandle, backend: BackendKind },
    /// The backend ran the job synchronously.
    Finished {
        handle: JobHandle,
        results: ProfilingResults,
    },
}

impl Dispatched {
    /// Handle of the created job.
    pub const fn handle(&self) -> &JobHandle {
        match self {
            Self::Async { handle, .. } | Self::Finished { handle, .. } => handle,
        }
    }
}

/// Backend-specific procedure that turns a spec into a job.
#[async_trait]
pub trait DispatchStrategy: Send + Sync {
    /// Backend this strategy dispatches to.
    fn backend(&self) -> BackendKind;

    /// Create the job for `spec`; `job_name` names cluster jobs.
    async fn dispatch(&self, job_name: &str, spec: &ProfilingRequestSpec) -> Result<Dispatched>;
}

/// Built-in algorithms on the Profiling Service.
pub struct SortingStrategy {
    service: Arc<dyn ProfilingService>,
}

impl SortingStrategy {
    pub fn new(service: Arc<dyn ProfilingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DispatchStrategy for SortingStrategy {
    fn backend(&self) -> BackendKind {
        BackendKind::Profiling
    }

    async fn dispatch(&self, _job_name: &str, spec: &ProfilingRequestSpec) -> Result<Dispatched> {
        let request = JobRequest {
            algorithm_name: spec.algorithm_name.clone(),
            input_size: spec.input_size,
            parameters: spec.parameters.clone(),
            priority: spec.priority,
        };
        let handle = self.service.create_job(&request).await?;
        Ok(Dispatched::Async {
            handle,
            backend: BackendKind::Profiling,
        })
    }
}

/// Synchronous tasks on the ML Service.
pub struct MlStrategy {
    service: Arc<dyn MlService>,
}

impl MlStrategy {
    pub fn new(service: Arc<dyn MlService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DispatchStrategy for MlStrategy {
    fn backend(&self) -> BackendKind {
        BackendKind::Ml
    }

    async fn dispatch(&self, _job_name: &str, spec: &ProfilingRequestSpec) -> Result<Dispatched> {
        let config = spec.ml_config.clone().unwrap_or_else(MlConfig::default);
        let request = MlRequest::from_config(&config, spec.iterations);
        let outcome = self.service.run(&request).await?;
        Ok(Dispatched::Finished {
            handle: outcome.handle,
            results: outcome.results,
        })
    }
}

/// Arbitrary containers on the Compute Cluster.
pub struct CustomStrategy {
    cluster: Arc<dyn ComputeCluster>,
}

impl CustomStrategy {
    pub fn new(cluster: Arc<dyn ComputeCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl DispatchStrategy for CustomStrategy {
    fn backend(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn dispatch(&self, job_name: &str, spec: &ProfilingRequestSpec) -> Result<Dispatched> {
        let config = spec.custom_config.clone().unwrap_or_else(CustomConfig::default);
        let job = BatchJobSpec::from_config(dns_label(job_name), &config);
        let handle = self.cluster.create_batch_job(&job).await?;
        Ok(Dispatched::Async {
            handle,
            backend: BackendKind::Cluster,
        })
    }
}

/// Lowercase alphanumerics and dashes, as cluster object names require.
fn dns_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    label.trim_matches('-').to_string()
}

/// The three strategies, selected by algorithm class.
#[derive(Clone)]
pub struct Strategies {
    sorting: Arc<dyn DispatchStrategy>,
    ml: Arc<dyn DispatchStrategy>,
    custom: Arc<dyn DispatchStrategy>,
}

impl Strategies {
    /// Strategies over a backend bundle.
    pub fn new(backends: &Backends) -> Self {
        Self {
            sorting: Arc::new(SortingStrategy::new(backends.profiling.clone())),
            ml: Arc::new(MlStrategy::new(backends.ml.clone())),
            custom: Arc::new(CustomStrategy::new(backends.cluster.clone())),
        }
    }

    /// Strategy for `class`.
    pub fn for_class(&self, class: AlgorithmClass) -> &dyn DispatchStrategy {
        match class {
            AlgorithmClass::Sorting => self.sorting.as_ref(),
            AlgorithmClass::Ml => self.ml.as_ref(),
            AlgorithmClass::Custom => self.custom.as_ref(),
        }
    }

    /// Dispatch `spec` with the strategy for its class, bounded by `timeout`.
    ///
    /// Never retried: a failure here is final for the resource.
    pub async fn dispatch(
        &self,
        job_name: &str,
        spec: &ProfilingRequestSpec,
        timeout: Duration,
    ) -> Result<Dispatched> {
        let strategy = self.for_class(spec.algorithm_class);
        debug!(job = %job_name, backend = %strategy.backend(), algorithm = %spec.algorithm_name, "dispatching");
        let dispatched = tokio::time::timeout(timeout, strategy.dispatch(job_name, spec))
            .await
            .map_err(|_| Error::dispatch_timeout(strategy.backend().to_string(), timeout))??;
        info!(job = %job_name, job_handle = %dispatched.handle(), backend = %strategy.backend(), "job dispatched");
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;
    use dprof_backends::{InMemoryComputeCluster, InMemoryMlService, InMemoryProfilingService};
    use dprof_resources::{MlTask, ProfilingRequestSpec};

    struct Fakes {
        profiling: Arc<InMemoryProfilingService>,
        ml: Arc<InMemoryMlService>,
        cluster: Arc<InMemoryComputeCluster>,
        strategies: Strategies,
    }

    fn fakes() -> Fakes {
        let profiling = InMemoryProfilingService::new_arc();
        let ml = InMemoryMlService::new_arc();
        let cluster = InMemoryComputeCluster::new_arc();
        let backends = Backends::new(profiling.clone(), ml.clone(), cluster.clone());
        Fakes {
            profiling,
            ml,
            cluster,
            strategies: Strategies::new(&backends),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_sorting_creates_profiling_job() -> Result<()> {
        let fakes = fakes();
        let mut spec = ProfilingRequestSpec::new(AlgorithmClass::Sorting, "bubble_sort");
        spec.input_size = 1000;

        let dispatched = fakes.strategies.dispatch("sort-1000", &spec, TIMEOUT).await?;
        assert_eq!(
            dispatched,
            Dispatched::Async {
                handle: JobHandle::new("J1"),
                backend: BackendKind::Profiling,
            }
        );
        let created = fakes.profiling.created().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].input_size, 1000);
        assert_eq!(created[0].priority, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_ml_finishes_synchronously() -> Result<()> {
        let fakes = fakes();
        let mut spec = ProfilingRequestSpec::new(AlgorithmClass::Ml, "fs");
        spec.ml_config = Some(MlConfig {
            task: MlTask::FeatureSelection,
            ..MlConfig::default()
        });

        let dispatched = fakes.strategies.dispatch("fs-1", &spec, TIMEOUT).await?;
        let Dispatched::Finished { results, .. } = dispatched else {
            panic!("ML dispatch must finish synchronously");
        };
        assert!(results.ml_results.is_some());
        assert_eq!(fakes.ml.calls().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_custom_uses_container_config() -> Result<()> {
        let fakes = fakes();
        let mut spec = ProfilingRequestSpec::new(AlgorithmClass::Custom, "echo");
        spec.custom_config = Some(CustomConfig {
            args: vec!["hi".to_string()],
            ..CustomConfig::default()
        });

        fakes.strategies.dispatch("Echo_Job", &spec, TIMEOUT).await?;
        let created = fakes.cluster.created().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].resource_name, "echo-job");
        assert_eq!(created[0].image, "alpine:latest");
        assert_eq!(created[0].command, vec!["echo".to_string()]);
        assert_eq!(created[0].args, vec!["hi".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_dispatch_times_out() {
        let fakes = fakes();
        fakes
            .profiling
            .set_create_delay(Duration::from_millis(500))
            .await;
        let spec = ProfilingRequestSpec::new(AlgorithmClass::Sorting, "bubble_sort");

        let result = fakes
            .strategies
            .dispatch("slow", &spec, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::DispatchTimeout { .. })));
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("cmp-1-Bubble_Sort"), "cmp-1-bubble-sort");
        assert_eq!(dns_label("_x_"), "x");
    }
}
