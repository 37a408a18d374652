//! Status merge rules.
//!
//! Status writes are deltas merged against the freshly read status. The
//! merge refuses anything that would move a phase backwards, leave a
//! terminal phase or reassign a job handle, and it reports no-op updates so
//! callers can skip the write.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Condition, ConditionReason, JobHandle, Phase};

/// Fields shared by the status of every resource kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(
        default,
        rename = "startTime",
        alias = "startedAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "completionTime",
        alias = "completedAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl StatusCore {
    /// Current phase; an absent phase is Pending.
    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or_default()
    }

    /// Apply a core delta in place, returning whether anything changed.
    pub fn apply(&mut self, update: &CoreUpdate) -> Result<bool, RejectReason> {
        let current = self.phase();
        if current.is_terminal() {
            return Err(RejectReason::Terminal { phase: current });
        }

        let mut changed = false;

        if let Some(next) = update.phase {
            if !current.can_transition_to(next) {
                return Err(RejectReason::Backward {
                    from: current,
                    to: next,
                });
            }
            if self.phase != Some(next) {
                self.phase = Some(next);
                changed = true;
            }
        }

        if let (Some(at), None) = (update.started_at, self.started_at) {
            self.started_at = Some(at);
            changed = true;
        }

        if let Some(at) = update.completed_at {
            if !self.phase().is_terminal() {
                return Err(RejectReason::CompletionWithoutTerminal);
            }
            if self.completed_at.is_none() {
                self.completed_at = Some(at);
                changed = true;
            }
        }

        if let Some(condition) = &update.condition {
            let repeated = self.conditions.last().is_some_and(|last| {
                last.type_ == condition.type_
                    && last.status == condition.status
                    && last.reason == condition.reason
                    && last.message == condition.message
            });
            if !repeated {
                self.conditions.push(condition.clone());
                changed = true;
            }
        }

        Ok(changed)
    }
}

/// Delta for the fields every status shares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreUpdate {
    pub phase: Option<Phase>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub condition: Option<Condition>,
}

impl CoreUpdate {
    /// Move to Running.
    pub fn running(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            phase: Some(Phase::Running),
            started_at: Some(at),
            completed_at: None,
            condition: Some(Condition::ready(
                Phase::Running,
                ConditionReason::JobCreated,
                message,
                at,
            )),
        }
    }

    /// Move to Completed.
    pub fn completed(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            phase: Some(Phase::Completed),
            started_at: Some(at),
            completed_at: Some(at),
            condition: Some(Condition::ready(
                Phase::Completed,
                ConditionReason::Completed,
                message,
                at,
            )),
        }
    }

    /// Move to Failed.
    pub fn failed(reason: ConditionReason, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            phase: Some(Phase::Failed),
            started_at: Some(at),
            completed_at: Some(at),
            condition: Some(Condition::ready(Phase::Failed, reason, message, at)),
        }
    }
}

/// Delta for a `ProfilingRequest` status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub core: CoreUpdate,
    pub job_handle: Option<JobHandle>,
    pub results: Option<crate::types::ProfilingResults>,
}

impl StatusUpdate {
    /// A backend job was created and is now running.
    pub fn dispatched(handle: JobHandle, at: DateTime<Utc>) -> Self {
        let message = format!("Job {handle} created");
        Self {
            core: CoreUpdate::running(message, at),
            job_handle: Some(handle),
            results: None,
        }
    }

    /// The backend confirmed success.
    pub fn completed(results: crate::types::ProfilingResults, at: DateTime<Utc>) -> Self {
        Self {
            core: CoreUpdate::completed("Algorithm profiling completed", at),
            job_handle: None,
            results: Some(results),
        }
    }

    /// A synchronous backend returned final results in the dispatch call.
    pub fn completed_synchronously(
        handle: JobHandle,
        results: crate::types::ProfilingResults,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_handle: Some(handle),
            ..Self::completed(results, at)
        }
    }

    /// The resource failed for good.
    pub fn failed(reason: ConditionReason, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            core: CoreUpdate::failed(reason, message, at),
            job_handle: None,
            results: None,
        }
    }
}

/// Why a merge was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The status is already terminal.
    Terminal { phase: Phase },
    /// The update would move the phase backwards.
    Backward { from: Phase, to: Phase },
    /// The update carries a different handle than the one recorded.
    HandleReassigned { current: JobHandle, proposed: JobHandle },
    /// A completion time without a terminal phase.
    CompletionWithoutTerminal,
    /// Results without a Completed phase.
    ResultsWithoutCompletion,
    /// The update does not match the shape of the current status.
    Mismatch { reason: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal { phase } => write!(f, "status is terminal ({phase})"),
            Self::Backward { from, to } => write!(f, "phase cannot move from {from} to {to}"),
            Self::HandleReassigned { current, proposed } => {
                write!(f, "job handle {current} cannot be replaced by {proposed}")
            }
            Self::CompletionWithoutTerminal => {
                write!(f, "completion time requires a terminal phase")
            }
            Self::ResultsWithoutCompletion => write!(f, "results require phase Completed"),
            Self::Mismatch { reason } => write!(f, "update does not fit status: {reason}"),
        }
    }
}

/// Outcome of merging a delta into a status.
#[derive(Debug, Clone, PartialEq)]
pub enum Merge<S> {
    /// The merged status differs and should be written.
    Changed(S),
    /// The update is already reflected; nothing to write.
    Unchanged,
    /// The update violates a status invariant and must be dropped.
    Rejected(RejectReason),
}

/// A status that accepts deltas under the monotonicity rules.
pub trait MergeStatus: Sized {
    /// Delta type for this status.
    type Update: Clone + fmt::Debug + Send + Sync;

    /// Merge `update` into a copy of `self`.
    fn merge(&self, update: &Self::Update) -> Merge<Self>;

    /// Current phase.
    fn current_phase(&self) -> Phase;
}

/// Keep a write-once handle: set when absent, reject a different one.
pub(crate) fn merge_handle(
    slot: &mut Option<JobHandle>,
    proposed: Option<&JobHandle>,
) -> Result<bool, RejectReason> {
    match (slot.as_ref(), proposed) {
        (_, None) => Ok(false),
        (None, Some(handle)) => {
            *slot = Some(handle.clone());
            Ok(true)
        }
        (Some(current), Some(handle)) if current == handle => Ok(false),
        (Some(current), Some(handle)) => Err(RejectReason::HandleReassigned {
            current: current.clone(),
            proposed: handle.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_running_then_completed() -> std::result::Result<(), RejectReason> {
        let now = Utc::now();
        let mut core = StatusCore::default();

        assert!(core.apply(&CoreUpdate::running("started", now))?);
        assert_eq!(core.phase(), Phase::Running);
        assert_eq!(core.started_at, Some(now));

        let later = now + chrono::Duration::seconds(3);
        assert!(core.apply(&CoreUpdate::completed("done", later))?);
        assert_eq!(core.phase(), Phase::Completed);
        assert_eq!(core.started_at, Some(now));
        assert_eq!(core.completed_at, Some(later));
        assert_eq!(core.conditions.len(), 2);
        Ok(())
    }

    #[test]
    fn test_terminal_rejects_everything() {
        let now = Utc::now();
        let mut core = StatusCore {
            phase: Some(Phase::Failed),
            ..StatusCore::default()
        };
        let result = core.apply(&CoreUpdate::completed("late", now));
        assert_eq!(
            result,
            Err(RejectReason::Terminal {
                phase: Phase::Failed
            })
        );
        assert!(core.conditions.is_empty());
    }

    #[test]
    fn test_backward_rejected() {
        let mut core = StatusCore {
            phase: Some(Phase::Running),
            ..StatusCore::default()
        };
        let update = CoreUpdate {
            phase: Some(Phase::Pending),
            ..CoreUpdate::default()
        };
        assert!(matches!(
            core.apply(&update),
            Err(RejectReason::Backward { .. })
        ));
    }

    #[test]
    fn test_repeated_condition_is_not_duplicated() -> std::result::Result<(), RejectReason> {
        let now = Utc::now();
        let mut core = StatusCore::default();
        assert!(core.apply(&CoreUpdate::running("started", now))?);
        assert!(!core.apply(&CoreUpdate::running("started", now))?);
        assert_eq!(core.conditions.len(), 1);
        Ok(())
    }

    #[test]
    fn test_merge_handle_write_once() {
        let mut slot = None;
        let first = JobHandle::new("J1");
        let second = JobHandle::new("J2");
        assert_eq!(merge_handle(&mut slot, Some(&first)), Ok(true));
        assert_eq!(merge_handle(&mut slot, Some(&first)), Ok(false));
        assert!(merge_handle(&mut slot, Some(&second)).is_err());
        assert_eq!(slot, Some(first));
    }
}
