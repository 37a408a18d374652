//! Shared harness: a controller running against in-memory stores and backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use dprof_backends::{Backends, InMemoryComputeCluster, InMemoryMlService, InMemoryProfilingService};
use dprof_reconciler::{Controller, ReconcilerConfig, RetryPolicy};
use dprof_resources::{
    AlgorithmClass, ObjectMeta, Phase, ProfilingComparison, ProfilingRequest,
    ProfilingRequestSpec, ResourceKey, ResourceObject,
};
use dprof_store::{InMemoryResourceStore, ResourceStore, WatcherConfig};

pub type TestError = Box<dyn std::error::Error + Send + Sync>;
pub type TestResult<T = ()> = std::result::Result<T, TestError>;

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub fn config() -> ReconcilerConfig {
    ReconcilerConfig::default()
        .with_poll_interval(POLL_INTERVAL)
        .with_dispatch_timeout(Duration::from_secs(2))
}

pub fn watcher_config() -> WatcherConfig {
    WatcherConfig::new("default")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100))
        .with_resync_interval(None)
}

/// Stores and fake backends that outlive any one controller run.
#[derive(Clone)]
pub struct World {
    pub requests: Arc<InMemoryResourceStore<ProfilingRequest>>,
    pub comparisons: Arc<InMemoryResourceStore<ProfilingComparison>>,
    pub profiling: Arc<InMemoryProfilingService>,
    pub ml: Arc<InMemoryMlService>,
    pub cluster: Arc<InMemoryComputeCluster>,
}

impl World {
    pub fn new() -> Self {
        Self {
            requests: InMemoryResourceStore::new_arc(),
            comparisons: InMemoryResourceStore::new_arc(),
            profiling: InMemoryProfilingService::new_arc(),
            ml: InMemoryMlService::new_arc(),
            cluster: InMemoryComputeCluster::new_arc(),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends::new(self.profiling.clone(), self.ml.clone(), self.cluster.clone())
    }

    /// Start a controller over this world.
    pub fn start(&self) -> TestResult<Running> {
        let controller = Controller::new(
            self.requests.clone(),
            self.comparisons.clone(),
            self.backends(),
            config(),
            watcher_config(),
        )?
        .with_retry_policy(RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));
        Ok(Running { shutdown, task })
    }

    pub async fn create_request(&self, request: ProfilingRequest) -> TestResult<ResourceKey> {
        let key = request.key();
        self.requests.create(request).await?;
        Ok(key)
    }

    pub async fn create_comparison(&self, comparison: ProfilingComparison) -> TestResult<ResourceKey> {
        let key = comparison.key();
        self.comparisons.create(comparison).await?;
        Ok(key)
    }

    /// Poll the request store until `done` holds.
    pub async fn wait_request(
        &self,
        key: &ResourceKey,
        done: impl Fn(&ProfilingRequest) -> bool,
    ) -> TestResult<ProfilingRequest> {
        wait_for(self.requests.as_ref(), key, done).await
    }

    /// Poll the comparison store until `done` holds.
    pub async fn wait_comparison(
        &self,
        key: &ResourceKey,
        done: impl Fn(&ProfilingComparison) -> bool,
    ) -> TestResult<ProfilingComparison> {
        wait_for(self.comparisons.as_ref(), key, done).await
    }

    pub async fn request_phases(&self, key: &ResourceKey) -> Vec<Phase> {
        self.requests
            .status_writes(key)
            .await
            .iter()
            .map(|status| status.core.phase())
            .collect()
    }

    pub async fn comparison_phases(&self, key: &ResourceKey) -> Vec<Phase> {
        self.comparisons
            .status_writes(key)
            .await
            .iter()
            .map(|status| status.core.phase())
            .collect()
    }
}

async fn wait_for<R: ResourceObject>(
    store: &dyn ResourceStore<R>,
    key: &ResourceKey,
    done: impl Fn(&R) -> bool,
) -> TestResult<R> {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if let Ok(resource) = store.get(key).await {
            if done(&resource) {
                return Ok(resource);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("timed out waiting for {key}").into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A controller running in the background.
pub struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<dprof_reconciler::Result<()>>,
}

impl Running {
    /// Signal shutdown and wait for the controller to finish.
    pub async fn stop(self) -> TestResult {
        self.shutdown.send(true)?;
        tokio::time::timeout(Duration::from_secs(5), self.task).await???;
        Ok(())
    }
}

pub fn request(name: &str, class: AlgorithmClass, algorithm: &str) -> ProfilingRequest {
    ProfilingRequest::new(
        ObjectMeta::new("default", name),
        ProfilingRequestSpec::new(class, algorithm),
    )
}

/// Check that a recorded phase sequence never moves backwards.
pub fn assert_monotonic(phases: &[Phase]) {
    for pair in phases.windows(2) {
        assert!(
            pair[0] == pair[1] || pair[0].can_transition_to(pair[1]),
            "phase went from {} to {} in {phases:?}",
            pair[0],
            pair[1]
        );
    }
}
