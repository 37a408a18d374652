//! Reconciler for multi-algorithm comparisons.
//!
//! A comparison fans out one sub-job per declared algorithm, then waits on
//! all of them as a barrier. The first sub-job failure fails the whole
//! comparison and abandons the siblings still running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use dprof_backends::Backends;
use dprof_resources::{
    ComparisonResult, ComparisonUpdate, ConditionReason, JobHandle, Phase, ProfilingComparison,
    ProfilingResults, ResourceKey, ResourceObject, SubJobStatus,
};
use dprof_store::ResourceStore;

use crate::cleanup::CleanupHandler;
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::monitor::{BarrierOutcome, CompletionMonitor, MonitorHandle, MonitorTarget};
use crate::reconcile::{IdentityState, Reconcile};
use crate::status::{StatusWriter, WriteOutcome};
use crate::strategy::{BackendKind, Dispatched, Strategies};

/// What a comparison identity remembers between events.
#[derive(Debug, Clone, Default)]
pub struct ComparisonMemory {
    /// Asynchronous sub-jobs created by this controller.
    jobs: Vec<(JobHandle, BackendKind)>,
    /// Fan-out outcome; rewritten if it never landed.
    outcome: Option<ComparisonUpdate>,
    /// Results of sub-jobs that finished during dispatch, by entry index.
    sync_results: Vec<Option<ProfilingResults>>,
}

/// Drives `ProfilingComparison` resources.
#[derive(Clone)]
pub struct ComparisonReconciler {
    store: Arc<dyn ResourceStore<ProfilingComparison>>,
    writer: StatusWriter<ProfilingComparison>,
    strategies: Strategies,
    monitor: CompletionMonitor,
    cleanup: CleanupHandler,
    dispatch_timeout: Duration,
}

fn sub_job_name(comparison: &str, algorithm: &str) -> String {
    format!("{comparison}-{algorithm}")
}

impl ComparisonReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore<ProfilingComparison>>,
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

    async fn fan_out(
        &self,
        resource: ProfilingComparison,
        state: &mut IdentityState<ComparisonMemory>,
    ) -> Result<()> {
        let key = resource.key();
        let spec = &resource.spec;
        let now = Utc::now();

        if spec.algorithms.is_empty() {
            let update = ComparisonUpdate::failed(
                ConditionReason::JobCreationError,
                "Comparison declares no algorithms",
                Vec::new(),
                now,
            );
            return self.record_fan_out(&key, update, state).await;
        }

        let dispatches = spec.algorithms.iter().map(|entry| {
            let job_name = sub_job_name(&key.name, &entry.algorithm_name);
            let entry_spec = spec.entry_spec(entry);
            async move {
                self.strategies
                    .dispatch(&job_name, &entry_spec, self.dispatch_timeout)
                    .await
            }
        });
        let outcomes = join_all(dispatches).await;

        let mut jobs = Vec::with_capacity(outcomes.len());
        let mut created = Vec::new();
        let mut sync_results = vec![None; outcomes.len()];
        let mut first_failure: Option<(String, String)> = None;

        for (index, (entry, outcome)) in spec.algorithms.iter().zip(outcomes).enumerate() {
            let pending = SubJobStatus::pending(entry);
            match outcome {
                Ok(Dispatched::Async { handle, backend }) => {
                    created.push((index, handle.clone(), backend));
                    jobs.push(pending.running(handle));
                }
                Ok(Dispatched::Finished { handle, results }) => {
                    if let Some(slot) = sync_results.get_mut(index) {
                        *slot = Some(results);
                    }
                    jobs.push(pending.running(handle).finished(
                        Phase::Completed,
                        ConditionReason::Completed,
                        "Completed synchronously",
                    ));
                }
                Err(e) => {
                    warn!(resource = %key, algorithm = %entry.algorithm_name, error = %e, "sub-job creation failed");
                    let message = format!("Failed to create job: {e}");
                    if first_failure.is_none() {
                        first_failure = Some((entry.algorithm_name.clone(), e.to_string()));
                    }
                    jobs.push(pending.finished(Phase::Failed, ConditionReason::JobCreationError, message));
                }
            }
        }

        state.memory.jobs = created
            .iter()
            .map(|(_, handle, backend)| (handle.clone(), *backend))
            .collect();
        state.memory.sync_results = sync_results.clone();

        let update = if let Some((algorithm, error)) = first_failure {
            let abandoned: Vec<_> = created
                .iter()
                .map(|(_, handle, backend)| (handle.clone(), *backend))
                .collect();
            for (index, _, _) in &created {
                settle_at(&mut jobs, *index, |job| {
                    job.finished(
                        Phase::Failed,
                        ConditionReason::SiblingFailed,
                        format!("Cancelled after {algorithm} failed"),
                    )
                });
            }
            self.cleanup.cancel_all(&key, &abandoned).await;
            ComparisonUpdate::failed(
                ConditionReason::JobCreationError,
                format!("Failed to create job for {algorithm}: {error}"),
                jobs,
                now,
            )
        } else if created.is_empty() {
            let results = collect_results(&jobs, sync_results);
            ComparisonUpdate::completed(jobs, results, now)
        } else {
            ComparisonUpdate::dispatched(jobs, now)
        };

        self.record_fan_out(&key, update, state).await
    }

    async fn record_fan_out(
        &self,
        key: &ResourceKey,
        update: ComparisonUpdate,
        state: &mut IdentityState<ComparisonMemory>,
    ) -> Result<()> {
        state.memory.outcome = Some(update.clone());
        match self.writer.apply(key, &update).await?.into_resource() {
            Some(written) => {
                info!(resource = %key, phase = %written.phase(), "fan-out recorded");
                self.ensure_monitor(&written, state);
            }
            None => warn!(resource = %key, "fan-out could not be recorded"),
        }
        Ok(())
    }

    fn ensure_monitor(
        &self,
        resource: &ProfilingComparison,
        state: &mut IdentityState<ComparisonMemory>,
    ) {
        let Some(status) = resource.status.as_ref() else {
            return;
        };
        if status.core.phase().is_terminal() || status.jobs.is_empty() {
            return;
        }

        let started_at = status.core.started_at.unwrap_or_else(Utc::now);
        let timeout = resource.spec.timeout.as_duration();
        let (positions, targets): (Vec<usize>, Vec<MonitorTarget>) = status
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| !job.phase.is_terminal())
            .filter_map(|(position, job)| {
                let handle = job.job_handle.clone()?;
                let backend = BackendKind::for_class(job.algorithm_class);
                Some((position, MonitorTarget::new(handle, backend, started_at, timeout)))
            })
            .unzip();

        let mut sync_results = state.memory.sync_results.clone();
        sync_results.resize(status.jobs.len(), None);
        let barrier = Barrier {
            key: resource.key(),
            jobs: status.jobs.clone(),
            positions,
            targets,
            sync_results,
        };
        let monitor = self.monitor.clone();
        let writer = self.writer.clone();
        let cleanup = self.cleanup.clone();
        let key = resource.key();
        let started = state.ensure_monitor(|| {
            MonitorHandle::spawn(move |cancel| barrier.finish(monitor, writer, cleanup, cancel))
        });
        if started {
            debug!(resource = %key, "comparison monitor started");
        }
    }
}

fn collect_results(
    jobs: &[SubJobStatus],
    results: Vec<Option<ProfilingResults>>,
) -> Vec<ComparisonResult> {
    jobs.iter()
        .zip(results)
        .map(|(job, results)| ComparisonResult {
            algorithm_name: job.algorithm_name.clone(),
            algorithm_class: job.algorithm_class,
            results: results.unwrap_or_default(),
        })
        .collect()
}

/// Replace the sub-job at `position` with its settled form.
fn settle_at(
    jobs: &mut [SubJobStatus],
    position: usize,
    settle: impl FnOnce(SubJobStatus) -> SubJobStatus,
) {
    if let Some(job) = jobs.get_mut(position) {
        *job = settle(job.clone());
    }
}

/// Sub-jobs of one comparison being waited on together.
struct Barrier {
    key: ResourceKey,
    /// Recorded sub-job states in declaration order.
    jobs: Vec<SubJobStatus>,
    /// Declaration index of each target.
    positions: Vec<usize>,
    targets: Vec<MonitorTarget>,
    sync_results: Vec<Option<ProfilingResults>>,
}

impl Barrier {
    async fn finish(
        self,
        monitor: CompletionMonitor,
        writer: StatusWriter<ProfilingComparison>,
        cleanup: CleanupHandler,
        cancel: watch::Receiver<bool>,
    ) {
        let key = self.key.clone();
        info!(resource = %key, pending = self.targets.len(), "monitoring comparison");

        let outcome = monitor.watch_all(&self.targets, cancel.clone()).await;
        let Some(update) = self.settle(outcome, &cleanup).await else {
            debug!(resource = %key, "comparison monitor cancelled");
            return;
        };
        if *cancel.borrow() {
            return;
        }

        match writer.apply(&key, &update).await {
            Ok(WriteOutcome::Written(resource) | WriteOutcome::Unchanged(resource)) => {
                info!(resource = %key, phase = %resource.phase(), "comparison finished");
            }
            Ok(outcome) => {
                warn!(resource = %key, outcome = outcome.label(), "final status not recorded");
            }
            Err(e) => warn!(resource = %key, error = %e, "final status write failed"),
        }
    }

    async fn settle(self, outcome: BarrierOutcome, cleanup: &CleanupHandler) -> Option<ComparisonUpdate> {
        let now = Utc::now();
        let mut jobs = self.jobs;

        match outcome {
            BarrierOutcome::Cancelled => None,
            BarrierOutcome::AllSucceeded(results) => {
                let mut by_position = self.sync_results;
                for (position, results) in self.positions.iter().zip(results) {
                    settle_at(&mut jobs, *position, |job| {
                        job.finished(Phase::Completed, ConditionReason::Completed, "Job completed")
                    });
                    if let Some(slot) = by_position.get_mut(*position) {
                        *slot = Some(results);
                    }
                }

                // A sub-job recorded as failed before a restart still fails the barrier.
                if let Some(failed) = jobs.iter().find(|job| job.phase == Phase::Failed) {
                    let message = format!(
                        "Algorithm {} failed: {}",
                        failed.algorithm_name,
                        failed.message.as_deref().unwrap_or("unknown error"),
                    );
                    let reason = failed.reason.unwrap_or(ConditionReason::BackendReportedFailure);
                    return Some(ComparisonUpdate::failed(reason, message, jobs, now));
                }

                let results = collect_results(&jobs, by_position);
                Some(ComparisonUpdate::completed(jobs, results, now))
            }
            BarrierOutcome::Failed {
                index,
                reason,
                message,
                finished,
            } => {
                let failed_position = self.positions.get(index).copied()?;
                let failed_name = jobs.get(failed_position)?.algorithm_name.clone();
                let mut abandoned = Vec::new();

                let watched = self.positions.iter().zip(&self.targets).enumerate();
                for (target_index, (position, target)) in watched {
                    settle_at(&mut jobs, *position, |job| {
                        if target_index == index {
                            job.finished(Phase::Failed, reason, message.clone())
                        } else if finished.get(target_index).is_some_and(Option::is_some) {
                            job.finished(Phase::Completed, ConditionReason::Completed, "Job completed")
                        } else {
                            abandoned.push((target.handle.clone(), target.backend));
                            job.finished(
                                Phase::Failed,
                                ConditionReason::SiblingFailed,
                                format!("Cancelled after {failed_name} failed"),
                            )
                        }
                    });
                }

                cleanup.cancel_all(&self.key, &abandoned).await;
                Some(ComparisonUpdate::failed(
                    reason,
                    format!("Algorithm {failed_name} failed: {message}"),
                    jobs,
                    now,
                ))
            }
        }
    }
}

#[async_trait]
impl Reconcile for ComparisonReconciler {
    type Resource = ProfilingComparison;
    type Memory = ComparisonMemory;

    async fn reconcile(
        &self,
        resource: ProfilingComparison,
        state: &mut IdentityState<ComparisonMemory>,
    ) -> Result<()> {
        let key = resource.key();
        if resource.phase().is_terminal() {
            debug!(resource = %key, phase = %resource.phase(), "terminal, ignoring event");
            return Ok(());
        }

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

        let recorded = fresh.status.as_ref().is_some_and(|status| !status.jobs.is_empty());
        if !recorded {
            if let Some(update) = state.memory.outcome.clone() {
                info!(resource = %key, "re-recording earlier fan-out");
                match self.writer.apply(&key, &update).await?.into_resource() {
                    Some(written) => fresh = written,
                    None => return Ok(()),
                }
            } else if fresh.phase() == Phase::Pending {
                return self.fan_out(fresh, state).await;
            } else {
                warn!(resource = %key, phase = %fresh.phase(), "no sub-jobs recorded, leaving as is");
                return Ok(());
            }
        }

        self.ensure_monitor(&fresh, state);
        Ok(())
    }

    async fn cleanup(
        &self,
        resource: ProfilingComparison,
        state: &mut IdentityState<ComparisonMemory>,
    ) {
        let key = resource.key();
        state.stop_monitor().await;

        // Siblings abandoned after a failure were already cancelled.
        let mut jobs: Vec<(JobHandle, BackendKind)> = resource
            .status
            .iter()
            .flat_map(|status| status.jobs.iter())
            .filter(|job| job.reason != Some(ConditionReason::SiblingFailed))
            .filter_map(|job| {
                let handle = job.job_handle.clone()?;
                Some((handle, BackendKind::for_class(job.algorithm_class)))
            })
            .collect();
        if jobs.is_empty() && resource.phase() == Phase::Pending {
            jobs.clone_from(&state.memory.jobs);
        }

        if jobs.is_empty() {
            debug!(resource = %key, "deleted before any sub-job was created");
            return;
        }
        self.cleanup.cancel_all(&key, &jobs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_job_name() {
        assert_eq!(sub_job_name("cmp-1", "quick_sort"), "cmp-1-quick_sort");
    }

    #[test]
    fn test_settle_at_ignores_unknown_position() {
        let mut jobs = vec![SubJobStatus::pending(&dprof_resources::ComparisonEntry::new(
            dprof_resources::AlgorithmClass::Sorting,
            "a",
        ))];

        settle_at(&mut jobs, 3, |job| {
            job.finished(Phase::Failed, ConditionReason::SiblingFailed, "unused")
        });
        assert_eq!(jobs.first().map(|job| job.phase), Some(Phase::Pending));

        settle_at(&mut jobs, 0, |job| {
            job.finished(Phase::Completed, ConditionReason::Completed, "Job completed")
        });
        assert_eq!(jobs.first().map(|job| job.phase), Some(Phase::Completed));
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_collect_results_keeps_declaration_order() {
        let jobs: Vec<SubJobStatus> = ["a", "b"]
            .iter()
            .map(|name| {
                SubJobStatus::pending(&dprof_resources::ComparisonEntry::new(
                    dprof_resources::AlgorithmClass::Sorting,
                    *name,
                ))
            })
            .collect();
        let results = collect_results(
            &jobs,
            vec![
                Some(ProfilingResults {
                    execution_time: 1.0,
                    ..ProfilingResults::default()
                }),
                None,
            ],
        );

        assert_eq!(results[0].algorithm_name, "a");
        assert!((results[0].results.execution_time - 1.0).abs() < f64::EPSILON);
        assert_eq!(results[1].algorithm_name, "b");
        assert_eq!(results[1].results, ProfilingResults::default());
    }
}
