//! Completion monitor.
//!
//! Polls a backend job on a fixed interval until the backend reports a
//! terminal state, the resource deadline passes, or the monitor is
//! cancelled. Poll failures never end monitoring; only a backend-confirmed
//! outcome or the deadline does.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dprof_backends::{Backends, JobProgress};
use dprof_resources::{ConditionReason, JobHandle, ProfilingResults};

use crate::strategy::BackendKind;

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// One job to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub handle: JobHandle,
    pub backend: BackendKind,
    /// Wall-clock deadline: the resource's start time plus its timeout.
    pub deadline: DateTime<Utc>,
}

impl MonitorTarget {
    /// Target whose deadline is `started_at + timeout`.
    pub fn new(
        handle: JobHandle,
        backend: BackendKind,
        started_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            handle,
            backend,
            deadline,
        }
    }

    fn deadline_instant(&self) -> Instant {
        let now = Instant::now();
        let remaining = self
            .deadline
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        // Far-future deadlines would overflow Instant.
        now.checked_add(remaining.min(FAR_FUTURE)).unwrap_or(now)
    }
}

/// How monitoring of one target ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    /// The backend confirmed success.
    Succeeded { results: ProfilingResults },
    /// The backend confirmed failure or the deadline passed.
    Failed {
        reason: ConditionReason,
        message: String,
    },
    /// Monitoring was cancelled; nothing may be written.
    Cancelled,
}

impl TargetOutcome {
    fn ends_barrier(&self) -> bool {
        !matches!(self, Self::Succeeded { .. })
    }
}

/// Outcome of watching several targets together.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierOutcome {
    /// Every target succeeded; results in target order.
    AllSucceeded(Vec<ProfilingResults>),
    /// A target failed; the others are either finished or abandoned.
    Failed {
        /// Index of the failed target.
        index: usize,
        reason: ConditionReason,
        message: String,
        /// Outcomes that had arrived by then, by target index.
        finished: Vec<Option<ProfilingResults>>,
    },
    /// Monitoring was cancelled.
    Cancelled,
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender also means the owner is gone.
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Polls backends for job completion.
#[derive(Clone)]
pub struct CompletionMonitor {
    backends: Backends,
    poll_interval: Duration,
}

impl CompletionMonitor {
    pub const fn new(backends: Backends, poll_interval: Duration) -> Self {
        Self {
            backends,
            poll_interval,
        }
    }

    /// Poll `target` until it finishes, its deadline passes or `cancel` fires.
    pub async fn watch_target(
        &self,
        target: &MonitorTarget,
        mut cancel: watch::Receiver<bool>,
    ) -> TargetOutcome {
        let deadline = target.deadline_instant();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancelled(&mut cancel) => return TargetOutcome::Cancelled,
                () = tokio::time::sleep_until(deadline) => return timed_out(target),
                _ = ticker.tick() => {}
            }

            let polled = tokio::select! {
                biased;
                () = cancelled(&mut cancel) => return TargetOutcome::Cancelled,
                () = tokio::time::sleep_until(deadline) => return timed_out(target),
                polled = self.poll_once(target) => polled,
            };
            if let Some(outcome) = polled {
                return outcome;
            }
        }
    }

    /// Watch every target at once; stops at the first failure.
    pub async fn watch_all(
        &self,
        targets: &[MonitorTarget],
        cancel: watch::Receiver<bool>,
    ) -> BarrierOutcome {
        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .enumerate()
            .map(|(index, target)| {
                let cancel = cancel.clone();
                async move { (index, self.watch_target(target, cancel).await) }
            })
            .collect();

        let mut finished: Vec<Option<ProfilingResults>> = vec![None; targets.len()];
        while let Some((index, outcome)) = pending.next().await {
            if outcome.ends_barrier() {
                return match outcome {
                    TargetOutcome::Failed { reason, message } => BarrierOutcome::Failed {
                        index,
                        reason,
                        message,
                        finished,
                    },
                    _ => BarrierOutcome::Cancelled,
                };
            }
            if let (TargetOutcome::Succeeded { results }, Some(slot)) =
                (outcome, finished.get_mut(index))
            {
                *slot = Some(results);
            }
        }

        BarrierOutcome::AllSucceeded(finished.into_iter().flatten().collect())
    }

    /// One status query; `None` means keep polling.
    async fn poll_once(&self, target: &MonitorTarget) -> Option<TargetOutcome> {
        match target.backend {
            BackendKind::Profiling => self.poll_profiling(&target.handle).await,
            BackendKind::Cluster => self.poll_cluster(&target.handle).await,
            // No status endpoint; the deadline bounds the wait.
            BackendKind::Ml => None,
        }
    }

    async fn poll_profiling(&self, handle: &JobHandle) -> Option<TargetOutcome> {
        let progress = match self.backends.profiling.job_status(handle).await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(job_handle = %handle, error = %e, transient = e.is_transient(), "status poll failed, retrying next interval");
                return None;
            }
        };
        debug!(job_handle = %handle, progress = ?progress, "polled profiling job");

        match progress {
            JobProgress::Pending | JobProgress::Running => None,
            JobProgress::Failed { message } => Some(backend_failure(message)),
            JobProgress::Succeeded => match self.backends.profiling.job_results(handle).await {
                Ok(results) => Some(TargetOutcome::Succeeded {
                    results: results.into_iter().next().unwrap_or_default(),
                }),
                Err(e) => {
                    warn!(job_handle = %handle, error = %e, "fetching results failed, retrying next interval");
                    None
                }
            },
        }
    }

    async fn poll_cluster(&self, handle: &JobHandle) -> Option<TargetOutcome> {
        let status = match self.backends.cluster.batch_job_status(handle).await {
            Ok(status) => status,
            Err(e) => {
                warn!(job_handle = %handle, error = %e, transient = e.is_transient(), "status poll failed, retrying next interval");
                return None;
            }
        };
        debug!(job_handle = %handle, progress = ?status.progress, "polled batch job");

        match &status.progress {
            JobProgress::Pending | JobProgress::Running => None,
            JobProgress::Failed { message } => Some(backend_failure(message.clone())),
            JobProgress::Succeeded => {
                let mut metrics = serde_json::Map::new();
                metrics.insert("jobName".to_string(), handle.as_str().into());
                Some(TargetOutcome::Succeeded {
                    results: ProfilingResults {
                        execution_time: status.execution_time_secs().unwrap_or_default(),
                        iterations: 1,
                        metrics,
                        ..ProfilingResults::default()
                    },
                })
            }
        }
    }
}

fn backend_failure(message: String) -> TargetOutcome {
    TargetOutcome::Failed {
        reason: ConditionReason::BackendReportedFailure,
        message,
    }
}

fn timed_out(target: &MonitorTarget) -> TargetOutcome {
    info!(job_handle = %target.handle, deadline = %target.deadline, "deadline passed");
    TargetOutcome::Failed {
        reason: ConditionReason::TimeoutExceeded,
        message: format!("Job {} did not finish before {}", target.handle, target.deadline),
    }
}

/// A running monitor task that can be cancelled.
pub struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Spawn `work`, handing it the cancellation receiver.
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, receiver) = watch::channel(false);
        let task = tokio::spawn(work(receiver));
        Self { cancel, task }
    }

    /// Check if the monitor is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel and wait until the task has let go of the backend.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(error = %e, "monitor task panicked");
            }
        }
    }
}
