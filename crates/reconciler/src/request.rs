//! Reconciler for single-algorithm profiling requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use dprof_backends::Backends;
use dprof_resources::{
    ConditionReason, JobHandle, Phase, ProfilingRequest, ResourceKey, ResourceObject, StatusUpdate,
};
use dprof_store::ResourceStore;

use crate::cleanup::CleanupHandler;
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::monitor::{CompletionMonitor, MonitorHandle, MonitorTarget, TargetOutcome};
use crate::reconcile::{IdentityState, Reconcile};
use crate::status::{StatusWriter, WriteOutcome};
use crate::strategy::{BackendKind, Dispatched, Strategies};

/// What a request identity remembers between events.
#[derive(Debug, Clone, Default)]
pub struct RequestMemory {
    /// Job created by this controller.
    job: Option<(JobHandle, BackendKind)>,
    /// Status update recording the dispatch; rewritten if it never landed.
    outcome: Option<StatusUpdate>,
}

/// Drives `ProfilingRequest` resources.
#[derive(Clone)]
pub struct RequestReconciler {
    store: Arc<dyn ResourceStore<ProfilingRequest>>,
    writer: StatusWriter<ProfilingRequest>,
    strategies: Strategies,
    monitor: CompletionMonitor,
    cleanup: CleanupHandler,
    dispatch_timeout: Duration,
}

impl RequestReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore<ProfilingRequest>>,
        backends: &Backends,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            writer: StatusWriter::new(store.clone(), config.status_patch_attempts),
            store,
            strategies: Strategies::new(backends),
            monitor: CompletionMonitor::new(backends.clone(), config.poll_interval),
            cleanup: CleanupHandler::new(backends.clone()),
            dispatch_timeout: config.dispatch_timeout,
        }
    }

    async fn dispatch(
        &self,
        resource: ProfilingRequest,
        state: &mut IdentityState<RequestMemory>,
    ) -> Result<()> {
        let key = resource.key();
        let now = Utc::now();

        let update = match self
            .strategies
            .dispatch(&key.name, &resource.spec, self.dispatch_timeout)
            .await
        {
            Ok(Dispatched::Async { handle, backend }) => {
                state.memory.job = Some((handle.clone(), backend));
                StatusUpdate::dispatched(handle, now)
            }
            Ok(Dispatched::Finished { handle, results }) => {
                state.memory.job = Some((handle.clone(), BackendKind::Ml));
                StatusUpdate::completed_synchronously(handle, results, now)
            }
            Err(e) => {
                warn!(resource = %key, error = %e, "job creation failed");
                StatusUpdate::failed(
                    ConditionReason::JobCreationError,
                    format!("Failed to create job: {e}"),
                    now,
                )
            }
        };
        state.memory.outcome = Some(update.clone());

        let outcome = self.writer.apply(&key, &update).await?;
        match outcome.into_resource() {
            Some(written) => {
                info!(resource = %key, phase = %written.phase(), "dispatch recorded");
                self.ensure_monitor(&written, state);
            }
            None => warn!(resource = %key, "dispatch could not be recorded"),
        }
        Ok(())
    }

    fn ensure_monitor(&self, resource: &ProfilingRequest, state: &mut IdentityState<RequestMemory>) {
        let Some(status) = resource.status.as_ref() else {
            return;
        };
        if status.core.phase().is_terminal() {
            return;
        }
        let Some(handle) = status.job_handle.clone() else {
            return;
        };

        let key = resource.key();
        let target = MonitorTarget::new(
            handle,
            BackendKind::for_class(resource.spec.algorithm_class),
            status.core.started_at.unwrap_or_else(Utc::now),
            resource.spec.timeout.as_duration(),
        );
        let monitor = self.monitor.clone();
        let writer = self.writer.clone();
        let started = state.ensure_monitor(|| {
            let key = key.clone();
            MonitorHandle::spawn(move |cancel| finish_request(monitor, writer, key, target, cancel))
        });
        if started {
            debug!(resource = %key, "completion monitor started");
        }
    }
}

async fn finish_request(
    monitor: CompletionMonitor,
    writer: StatusWriter<ProfilingRequest>,
    key: ResourceKey,
    target: MonitorTarget,
    cancel: watch::Receiver<bool>,
) {
    info!(resource = %key, job_handle = %target.handle, backend = %target.backend, deadline = %target.deadline, "monitoring job");
    let update = match monitor.watch_target(&target, cancel.clone()).await {
        TargetOutcome::Succeeded { results } => StatusUpdate::completed(results, Utc::now()),
        TargetOutcome::Failed { reason, message } => StatusUpdate::failed(reason, message, Utc::now()),
        TargetOutcome::Cancelled => {
            debug!(resource = %key, "monitor cancelled");
            return;
        }
    };
    if *cancel.borrow() {
        return;
    }

    match writer.apply(&key, &update).await {
        Ok(WriteOutcome::Written(resource) | WriteOutcome::Unchanged(resource)) => {
            info!(resource = %key, phase = %resource.phase(), "job finished");
        }
        Ok(outcome) => {
            warn!(resource = %key, outcome = outcome.label(), "final status not recorded");
        }
        Err(e) => warn!(resource = %key, error = %e, "final status write failed"),
    }
}

#[async_trait]
impl Reconcile for RequestReconciler {
    type Resource = ProfilingRequest;
    type Memory = RequestMemory;

    async fn reconcile(
        &self,
        resource: ProfilingRequest,
        state: &mut IdentityState<RequestMemory>,
    ) -> Result<()> {
        let key = resource.key();
        if resource.phase().is_terminal() {
            debug!(resource = %key, phase = %resource.phase(), "terminal, ignoring event");
            return Ok(());
        }

        // Decide on the stored copy; a queued event may be stale.
        let mut fresh = match self.store.get(&key).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => {
                debug!(resource = %key, "resource gone before reconcile");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if fresh.phase().is_terminal() {
            return Ok(());
        }

        if fresh.job_handle().is_none() {
            if let Some(update) = state.memory.outcome.clone() {
                info!(resource = %key, "re-recording earlier dispatch");
                match self.writer.apply(&key, &update).await?.into_resource() {
                    Some(written) => fresh = written,
                    None => return Ok(()),
                }
            } else if fresh.phase() == Phase::Pending {
                return self.dispatch(fresh, state).await;
            } else {
                warn!(resource = %key, phase = %fresh.phase(), "no job handle recorded, leaving as is");
                return Ok(());
            }
        }

        self.ensure_monitor(&fresh, state);
        Ok(())
    }

    async fn cleanup(&self, resource: ProfilingRequest, state: &mut IdentityState<RequestMemory>) {
        let key = resource.key();
        state.stop_monitor().await;

        let handle = resource
            .job_handle()
            .cloned()
            .or_else(|| state.memory.job.as_ref().map(|(handle, _)| handle.clone()));
        match handle {
            Some(handle) => {
                let backend = BackendKind::for_class(resource.spec.algorithm_class);
                self.cleanup.cancel(&key, &handle, backend).await;
            }
            None => debug!(resource = %key, "deleted before any job was created"),
        }
    }
}
