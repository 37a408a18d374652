//! Top-level controller wiring watchers to dispatchers.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{info, warn};

use dprof_backends::Backends;
use dprof_resources::{ProfilingComparison, ProfilingRequest};
use dprof_store::{ResourceStore, ResourceWatcher, WatcherConfig};

use crate::actor::RetryPolicy;
use crate::comparison::ComparisonReconciler;
use crate::config::ReconcilerConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::request::RequestReconciler;

/// Runs reconciliation for both resource kinds until shutdown.
pub struct Controller {
    requests: Arc<dyn ResourceStore<ProfilingRequest>>,
    comparisons: Arc<dyn ResourceStore<ProfilingComparison>>,
    backends: Backends,
    config: ReconcilerConfig,
    watcher: WatcherConfig,
    retry: RetryPolicy,
}

impl Controller {
    pub fn new(
        requests: Arc<dyn ResourceStore<ProfilingRequest>>,
        comparisons: Arc<dyn ResourceStore<ProfilingComparison>>,
        backends: Backends,
        config: ReconcilerConfig,
        watcher: WatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            requests,
            comparisons,
            backends,
            config,
            watcher,
            retry: RetryPolicy::default(),
        })
    }

    /// Set the retry policy for transient reconcile failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Watch, dispatch and reconcile until `shutdown` turns true.
    ///
    /// On shutdown the watchers stop, every identity actor is stopped and
    /// every completion monitor is cancelled before this returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles));
        let requests = EventDispatcher::new(
            RequestReconciler::new(self.requests.clone(), &self.backends, &self.config),
            permits.clone(),
        )
        .with_retry_policy(self.retry.clone());
        let comparisons = EventDispatcher::new(
            ComparisonReconciler::new(self.comparisons.clone(), &self.backends, &self.config),
            permits,
        )
        .with_retry_policy(self.retry.clone());

        let (request_tx, request_rx) = mpsc::channel(self.config.event_buffer);
        let (comparison_tx, comparison_rx) = mpsc::channel(self.config.event_buffer);

        info!(
            namespace = %self.watcher.namespace,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent_reconciles = self.config.max_concurrent_reconciles,
            "controller starting"
        );

        let tasks = vec![
            tokio::spawn(
                ResourceWatcher::new(self.requests, self.watcher.clone())
                    .run(request_tx, shutdown.clone()),
            ),
            tokio::spawn(
                ResourceWatcher::new(self.comparisons, self.watcher)
                    .run(comparison_tx, shutdown.clone()),
            ),
            tokio::spawn(requests.run(request_rx, shutdown.clone())),
            tokio::spawn(comparisons.run(comparison_rx, shutdown)),
        ];

        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller stopped");
        Ok(())
    }
}
