//! Multi-algorithm comparisons.
//!
//! A comparison declares N algorithm entries over one shared input size. Each
//! entry becomes an independent sub-job; the aggregate phase is Completed only
//! when every sub-job succeeded and Failed as soon as one fails.

use serde::{Deserialize, Serialize};

use crate::duration::ProfilingTimeout;
use crate::meta::{ObjectMeta, ResourceObject};
use crate::request::{ProfilingRequestSpec, default_iterations, default_priority};
use crate::status::{CoreUpdate, Merge, MergeStatus, RejectReason, StatusCore, merge_handle};
use crate::types::{
    AlgorithmClass, ConditionReason, CustomConfig, JobHandle, MlConfig, Phase, ProfilingResults,
};

/// One algorithm to run as part of a comparison.
///
/// Accepts either a bare algorithm name (a sorting algorithm) or a full
/// object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "EntryRepr")]
pub struct ComparisonEntry {
    pub algorithm_name: String,
    pub algorithm_class: AlgorithmClass,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_config: Option<MlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryObject {
    algorithm_name: String,
    #[serde(default, alias = "algorithmType")]
    algorithm_class: AlgorithmClass,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    ml_config: Option<MlConfig>,
    #[serde(default)]
    custom_config: Option<CustomConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntryRepr {
    Name(String),
    Object(EntryObject),
}

impl From<EntryRepr> for ComparisonEntry {
    fn from(repr: EntryRepr) -> Self {
        match repr {
            EntryRepr::Name(name) => Self::new(AlgorithmClass::Sorting, name),
            EntryRepr::Object(entry) => Self {
                algorithm_name: entry.algorithm_name,
                algorithm_class: entry.algorithm_class,
                parameters: entry.parameters,
                ml_config: entry.ml_config,
                custom_config: entry.custom_config,
            },
        }
    }
}

impl ComparisonEntry {
    /// Entry with no parameters or class-specific config.
    pub fn new(algorithm_class: AlgorithmClass, algorithm_name: impl Into<String>) -> Self {
        Self {
            algorithm_name: algorithm_name.into(),
            algorithm_class,
            parameters: serde_json::Map::new(),
            ml_config: None,
            custom_config: None,
        }
    }
}

/// Desired state of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSpec {
    pub algorithms: Vec<ComparisonEntry>,
    #[serde(default)]
    pub input_size: u64,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub timeout: ProfilingTimeout,
}

impl ComparisonSpec {
    /// The request spec a single entry is dispatched with.
    pub fn entry_spec(&self, entry: &ComparisonEntry) -> ProfilingRequestSpec {
        ProfilingRequestSpec {
            algorithm_class: entry.algorithm_class,
            algorithm_name: entry.algorithm_name.clone(),
            input_size: self.input_size,
            iterations: self.iterations,
            priority: self.priority,
            parameters: entry.parameters.clone(),
            timeout: self.timeout,
            ml_config: entry.ml_config.clone(),
            custom_config: entry.custom_config.clone(),
        }
    }
}

/// Observed state of one comparison sub-job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubJobStatus {
    pub algorithm_name: String,
    pub algorithm_class: AlgorithmClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<JobHandle>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubJobStatus {
    /// A sub-job that has not been dispatched.
    pub fn pending(entry: &ComparisonEntry) -> Self {
        Self {
            algorithm_name: entry.algorithm_name.clone(),
            algorithm_class: entry.algorithm_class,
            job_handle: None,
            phase: Phase::Pending,
            reason: None,
            message: None,
        }
    }

    /// Same sub-job, now running under `handle`.
    #[must_use]
    pub fn running(mut self, handle: JobHandle) -> Self {
        self.job_handle = Some(handle);
        self.phase = Phase::Running;
        self
    }

    /// Same sub-job, now in the terminal phase `phase`.
    #[must_use]
    pub fn finished(
        mut self,
        phase: Phase,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        self.phase = phase;
        self.reason = Some(reason);
        self.message = Some(message.into());
        self
    }

    fn absorb(&mut self, proposed: &Self) -> Result<bool, RejectReason> {
        if self.algorithm_name != proposed.algorithm_name {
            return Err(RejectReason::Mismatch {
                reason: format!(
                    "sub-job '{}' cannot become '{}'",
                    self.algorithm_name, proposed.algorithm_name
                ),
            });
        }

        let mut changed = merge_handle(&mut self.job_handle, proposed.job_handle.as_ref())?;

        if self.phase.is_terminal() {
            // Terminal sub-jobs keep their outcome.
            return if proposed.phase == self.phase {
                Ok(changed)
            } else {
                Err(RejectReason::Terminal { phase: self.phase })
            };
        }

        if proposed.phase != self.phase {
            if !self.phase.can_transition_to(proposed.phase) {
                return Err(RejectReason::Backward {
                    from: self.phase,
                    to: proposed.phase,
                });
            }
            self.phase = proposed.phase;
            changed = true;
        }
        if proposed.reason.is_some() && proposed.reason != self.reason {
            self.reason = proposed.reason;
            changed = true;
        }
        if proposed.message.is_some() && proposed.message != self.message {
            self.message.clone_from(&proposed.message);
            changed = true;
        }
        Ok(changed)
    }
}

/// Outcome of one successful sub-job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub algorithm_name: String,
    pub algorithm_class: AlgorithmClass,
    pub results: ProfilingResults,
}

/// Observed state of a comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonStatus {
    #[serde(flatten)]
    pub core: StatusCore,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<SubJobStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ComparisonResult>,
}

impl ComparisonStatus {
    /// Handles of every dispatched sub-job, in declaration order.
    pub fn job_handles(&self) -> impl Iterator<Item = &JobHandle> {
        self.jobs.iter().filter_map(|job| job.job_handle.as_ref())
    }
}

/// Delta for a `ProfilingComparison` status.
///
/// `jobs` lists sub-job states by declaration index; entries beyond the
/// recorded list are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComparisonUpdate {
    pub core: CoreUpdate,
    pub jobs: Vec<SubJobStatus>,
    pub results: Option<Vec<ComparisonResult>>,
}

impl ComparisonUpdate {
    /// Every sub-job was dispatched.
    pub fn dispatched(jobs: Vec<SubJobStatus>, at: chrono::DateTime<chrono::Utc>) -> Self {
        let message = format!("Created {} comparison jobs", jobs.len());
        Self {
            core: CoreUpdate::running(message, at),
            jobs,
            results: None,
        }
    }

    /// Every sub-job succeeded.
    pub fn completed(
        jobs: Vec<SubJobStatus>,
        results: Vec<ComparisonResult>,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let message = format!("All {} algorithms completed", results.len());
        Self {
            core: CoreUpdate::completed(message, at),
            jobs,
            results: Some(results),
        }
    }

    /// The comparison failed.
    pub fn failed(
        reason: ConditionReason,
        message: impl Into<String>,
        jobs: Vec<SubJobStatus>,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            core: CoreUpdate::failed(reason, message, at),
            jobs,
            results: None,
        }
    }
}

impl MergeStatus for ComparisonStatus {
    type Update = ComparisonUpdate;

    fn merge(&self, update: &ComparisonUpdate) -> Merge<Self> {
        let mut next = self.clone();

        let result = (|| -> Result<bool, RejectReason> {
            let mut changed = next.core.apply(&update.core)?;

            for (index, proposed) in update.jobs.iter().enumerate() {
                match next.jobs.get_mut(index) {
                    Some(current) => changed |= current.absorb(proposed)?,
                    None => {
                        next.jobs.push(proposed.clone());
                        changed = true;
                    }
                }
            }

            if let Some(results) = &update.results {
                if next.core.phase() != Phase::Completed {
                    return Err(RejectReason::ResultsWithoutCompletion);
                }
                if &next.results != results {
                    next.results.clone_from(results);
                    changed = true;
                }
            }
            Ok(changed)
        })();

        match result {
            Ok(true) => Merge::Changed(next),
            Ok(false) => Merge::Unchanged,
            Err(reason) => Merge::Rejected(reason),
        }
    }

    fn current_phase(&self) -> Phase {
        self.core.phase()
    }
}

/// A declarative comparison of several algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingComparison {
    pub metadata: ObjectMeta,
    pub spec: ComparisonSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ComparisonStatus>,
}

impl ProfilingComparison {
    /// A new comparison with no status.
    pub fn new(metadata: ObjectMeta, spec: ComparisonSpec) -> Self {
        Self {
            metadata,
            spec,
            status: None,
        }
    }

    /// Current aggregate phase.
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map_or(Phase::Pending, |status| status.core.phase())
    }
}

impl ResourceObject for ProfilingComparison {
    type Status = ComparisonStatus;

    const KIND: &'static str = "AlgorithmComparison";
    const PLURAL: &'static str = "algorithmcomparisons";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> Option<&ComparisonStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ComparisonStatus) {
        self.status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn entries() -> Vec<ComparisonEntry> {
        ["A", "B", "C"]
            .into_iter()
            .map(|name| ComparisonEntry::new(AlgorithmClass::Sorting, name))
            .collect()
    }

    #[test]
    fn test_entries_accept_names_and_objects() -> Result<(), serde_json::Error> {
        let spec: ComparisonSpec = serde_json::from_value(serde_json::json!({
            "algorithms": [
                "quick_sort",
                {"algorithmName": "fs", "algorithmClass": "ml",
                 "mlConfig": {"task": "feature_selection"}}
            ],
            "inputSize": 500
        }))?;

        assert_eq!(spec.algorithms.len(), 2);
        assert_eq!(spec.algorithms[0].algorithm_class, AlgorithmClass::Sorting);
        assert_eq!(spec.algorithms[1].algorithm_class, AlgorithmClass::Ml);

        let entry = spec.entry_spec(&spec.algorithms[1]);
        assert_eq!(entry.input_size, 500);
        assert_eq!(entry.priority, 5);
        assert!(entry.ml_config.is_some());
        Ok(())
    }

    fn changed<S: std::fmt::Debug>(merge: Merge<S>) -> Result<S, String> {
        match merge {
            Merge::Changed(status) => Ok(status),
            other => Err(format!("expected a change, got {other:?}")),
        }
    }

    #[test]
    fn test_dispatch_then_fail() -> Result<(), String> {
        let now = Utc::now();
        let jobs: Vec<SubJobStatus> = entries()
            .iter()
            .enumerate()
            .map(|(i, e)| SubJobStatus::pending(e).running(JobHandle::new(format!("J{}", i + 1))))
            .collect();

        let running =
            changed(ComparisonStatus::default().merge(&ComparisonUpdate::dispatched(jobs.clone(), now)))?;
        assert_eq!(running.core.phase(), Phase::Running);
        assert_eq!(running.job_handles().count(), 3);

        let mut finished = jobs;
        finished[1] = finished[1].clone().finished(
            Phase::Failed,
            ConditionReason::BackendReportedFailure,
            "boom",
        );
        let failed = ComparisonUpdate::failed(
            ConditionReason::BackendReportedFailure,
            "B failed",
            finished,
            now,
        );
        let status = changed(running.merge(&failed))?;
        assert_eq!(status.core.phase(), Phase::Failed);
        assert_eq!(status.jobs[1].phase, Phase::Failed);
        assert_eq!(status.jobs[0].phase, Phase::Running);
        assert!(status.results.is_empty());
        Ok(())
    }

    #[test]
    fn test_results_only_with_completion() -> Result<(), String> {
        let now = Utc::now();
        let jobs: Vec<SubJobStatus> = entries().iter().map(SubJobStatus::pending).collect();
        let running =
            changed(ComparisonStatus::default().merge(&ComparisonUpdate::dispatched(jobs.clone(), now)))?;

        let results = vec![ComparisonResult {
            algorithm_name: "A".to_string(),
            algorithm_class: AlgorithmClass::Sorting,
            results: ProfilingResults::default(),
        }];
        let premature = ComparisonUpdate {
            results: Some(results.clone()),
            ..ComparisonUpdate::default()
        };
        assert_eq!(
            running.merge(&premature),
            Merge::Rejected(RejectReason::ResultsWithoutCompletion)
        );

        let done = changed(running.merge(&ComparisonUpdate::completed(jobs, results.clone(), now)))?;
        assert_eq!(done.core.phase(), Phase::Completed);
        assert_eq!(done.results, results);
        Ok(())
    }

    #[test]
    fn test_sub_job_handle_is_write_once() {
        let entry = ComparisonEntry::new(AlgorithmClass::Sorting, "A");
        let status = ComparisonStatus {
            jobs: vec![SubJobStatus::pending(&entry).running(JobHandle::new("J1"))],
            core: StatusCore {
                phase: Some(Phase::Running),
                ..StatusCore::default()
            },
            ..ComparisonStatus::default()
        };
        let update = ComparisonUpdate {
            jobs: vec![SubJobStatus::pending(&entry).running(JobHandle::new("J9"))],
            ..ComparisonUpdate::default()
        };
        assert!(matches!(
            status.merge(&update),
            Merge::Rejected(RejectReason::HandleReassigned { .. })
        ));
    }
}
