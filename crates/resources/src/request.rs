//! Single-algorithm profiling requests.

use serde::{Deserialize, Serialize};

use crate::duration::ProfilingTimeout;
use crate::meta::{ObjectMeta, ResourceObject};
use crate::status::{Merge, MergeStatus, RejectReason, StatusCore, StatusUpdate, merge_handle};
use crate::types::{AlgorithmClass, CustomConfig, JobHandle, MlConfig, Phase, ProfilingResults};

pub(crate) const fn default_iterations() -> u32 {
    1
}

pub(crate) const fn default_priority() -> i32 {
    5
}

/// Desired state of a single profiling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingRequestSpec {
    #[serde(default, alias = "algorithmType")]
    pub algorithm_class: AlgorithmClass,
    pub algorithm_name: String,
    #[serde(default)]
    pub input_size: u64,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub timeout: ProfilingTimeout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_config: Option<MlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfig>,
}

impl ProfilingRequestSpec {
    /// Spec for `algorithm_name` with every other field at its default.
    pub fn new(algorithm_class: AlgorithmClass, algorithm_name: impl Into<String>) -> Self {
        Self {
            algorithm_class,
            algorithm_name: algorithm_name.into(),
            input_size: 0,
            iterations: default_iterations(),
            priority: default_priority(),
            parameters: serde_json::Map::new(),
            timeout: ProfilingTimeout::default(),
            ml_config: None,
            custom_config: None,
        }
    }
}

/// Observed state of a single profiling run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingStatus {
    #[serde(flatten)]
    pub core: StatusCore,
    #[serde(default, alias = "jobId", skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<JobHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ProfilingResults>,
}

impl MergeStatus for ProfilingStatus {
    type Update = StatusUpdate;

    fn merge(&self, update: &StatusUpdate) -> Merge<Self> {
        let mut next = self.clone();

        let result = (|| -> Result<bool, RejectReason> {
            let mut changed = next.core.apply(&update.core)?;
            changed |= merge_handle(&mut next.job_handle, update.job_handle.as_ref())?;

            if let Some(results) = &update.results {
                if next.core.phase() != Phase::Completed {
                    return Err(RejectReason::ResultsWithoutCompletion);
                }
                if next.results.as_ref() != Some(results) {
                    next.results = Some(results.clone());
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

/// A declarative request to profile one algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingRequest {
    pub metadata: ObjectMeta,
    pub spec: ProfilingRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProfilingStatus>,
}

impl ProfilingRequest {
    /// A new request with no status.
    pub fn new(metadata: ObjectMeta, spec: ProfilingRequestSpec) -> Self {
        Self {
            metadata,
            spec,
            status: None,
        }
    }

    /// Current phase, Pending when no status has been written.
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map_or(Phase::Pending, |status| status.core.phase())
    }

    /// Recorded backend handle, if any.
    pub fn job_handle(&self) -> Option<&JobHandle> {
        self.status.as_ref().and_then(|status| status.job_handle.as_ref())
    }
}

impl ResourceObject for ProfilingRequest {
    type Status = ProfilingStatus;

    const KIND: &'static str = "AlgorithmProfiling";
    const PLURAL: &'static str = "algorithmprofilings";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> Option<&ProfilingStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ProfilingStatus) {
        self.status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use chrono::Utc;

    use super::*;
    use crate::types::ConditionReason;

    #[test]
    fn test_spec_defaults_and_legacy_alias() -> Result<(), serde_json::Error> {
        let request: ProfilingRequest = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "sort-1000", "namespace": "default"},
            "spec": {
                "algorithmType": "sorting",
                "algorithmName": "bubble_sort",
                "inputSize": 1000
            }
        }))?;

        assert_eq!(request.spec.algorithm_class, AlgorithmClass::Sorting);
        assert_eq!(request.spec.iterations, 1);
        assert_eq!(request.spec.priority, 5);
        assert_eq!(request.spec.timeout, ProfilingTimeout::from_secs(3600));
        assert_eq!(request.phase(), Phase::Pending);
        assert!(request.job_handle().is_none());
        Ok(())
    }

    #[test]
    fn test_status_reads_legacy_job_id() -> Result<(), serde_json::Error> {
        let request: ProfilingRequest = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "sort-1000", "namespace": "default"},
            "spec": {"algorithmName": "bubble_sort", "inputSize": 1000},
            "status": {"phase": "Running", "jobId": "job-42"}
        }))?;

        assert_eq!(request.phase(), Phase::Running);
        assert_eq!(request.job_handle(), Some(&JobHandle::new("job-42")));

        let value = serde_json::to_value(&request)?;
        assert_eq!(value["status"]["jobHandle"], "job-42");
        assert!(value["status"].get("jobId").is_none());
        Ok(())
    }

    #[test]
    fn test_status_wire_names() -> Result<(), serde_json::Error> {
        let now = Utc::now();
        let status = match ProfilingStatus::default()
            .merge(&StatusUpdate::dispatched(JobHandle::new("J1"), now))
        {
            Merge::Changed(status) => status,
            other => panic!("expected change, got {other:?}"),
        };
        let value = serde_json::to_value(&status)?;
        assert_eq!(value["phase"], "Running");
        assert_eq!(value["jobHandle"], "J1");
        assert!(value.get("startTime").is_some());
        assert_eq!(value["conditions"][0]["reason"], "JobCreated");
        Ok(())
    }

    #[test]
    fn test_merge_full_lifecycle() {
        let now = Utc::now();
        let running = match ProfilingStatus::default()
            .merge(&StatusUpdate::dispatched(JobHandle::new("J1"), now))
        {
            Merge::Changed(status) => status,
            other => panic!("expected change, got {other:?}"),
        };

        let results = ProfilingResults {
            execution_time: 0.42,
            ..ProfilingResults::default()
        };
        let completed = match running.merge(&StatusUpdate::completed(results.clone(), now)) {
            Merge::Changed(status) => status,
            other => panic!("expected change, got {other:?}"),
        };
        assert_eq!(completed.core.phase(), Phase::Completed);
        assert_eq!(completed.job_handle, Some(JobHandle::new("J1")));
        assert_eq!(completed.results, Some(results));

        let late = StatusUpdate::failed(ConditionReason::TimeoutExceeded, "late", now);
        assert!(matches!(
            completed.merge(&late),
            Merge::Rejected(RejectReason::Terminal { .. })
        ));
    }

    #[test]
    fn test_merge_rejects_second_handle() {
        let now = Utc::now();
        let status = ProfilingStatus {
            job_handle: Some(JobHandle::new("J1")),
            core: StatusCore {
                phase: Some(Phase::Running),
                started_at: Some(now),
                ..StatusCore::default()
            },
            ..ProfilingStatus::default()
        };
        let update = StatusUpdate::dispatched(JobHandle::new("J2"), now);
        assert!(matches!(
            status.merge(&update),
            Merge::Rejected(RejectReason::HandleReassigned { .. })
        ));
    }

    #[test]
    fn test_merge_same_dispatch_twice_is_unchanged() {
        let now = Utc::now();
        let update = StatusUpdate::dispatched(JobHandle::new("J1"), now);
        let once = match ProfilingStatus::default().merge(&update) {
            Merge::Changed(status) => status,
            other => panic!("expected change, got {other:?}"),
        };
        assert_eq!(once.merge(&update), Merge::Unchanged);
    }

    #[test]
    fn test_results_require_completion() {
        let update = StatusUpdate {
            results: Some(ProfilingResults::default()),
            ..StatusUpdate::default()
        };
        assert_eq!(
            ProfilingStatus::default().merge(&update),
            Merge::Rejected(RejectReason::ResultsWithoutCompletion)
        );
    }
}
