//! Core types shared by both resource kinds.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a resource.
///
/// Phases only move forward: Pending → Running → {Completed | Failed}.
/// Pending may jump straight to a terminal phase (synchronous backends or
/// dispatch failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Declared but not yet dispatched.
    #[default]
    Pending,
    /// A backend job exists and is being monitored.
    Running,
    /// Terminal: the backend confirmed success.
    Completed,
    /// Terminal: dispatch failed, the backend reported failure or the
    /// deadline passed.
    Failed,
}

impl Phase {
    /// Check if this is a terminal phase.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Check if moving to `target` keeps the phase sequence monotonic.
    ///
    /// Staying in the same non-terminal phase is allowed; nothing leaves a
    /// terminal phase.
    pub const fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        target.rank() >= self.rank()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Opaque reference to a backend execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wrap a backend identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The backend identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which execution backend an algorithm runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmClass {
    /// Built-in algorithms run by the Profiling Service.
    #[default]
    Sorting,
    /// Synchronous ML Service tasks.
    Ml,
    /// Arbitrary containers run as Compute Cluster batch jobs.
    Custom,
}

impl fmt::Display for AlgorithmClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sorting => write!(f, "sorting"),
            Self::Ml => write!(f, "ml"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Observed state of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Machine-readable reason attached to a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    /// A backend job was created.
    JobCreated,
    /// The backend confirmed success.
    Completed,
    /// Dispatch to the backend failed.
    JobCreationError,
    /// The backend reported the job as failed.
    BackendReportedFailure,
    /// The per-resource timeout elapsed while polling.
    TimeoutExceeded,
    /// A comparison sub-job was cancelled because a sibling failed.
    SiblingFailed,
    /// Any reason this controller does not know about.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::JobCreated => "JobCreated",
            Self::Completed => "Completed",
            Self::JobCreationError => "JobCreationError",
            Self::BackendReportedFailure => "BackendReportedFailure",
            Self::TimeoutExceeded => "TimeoutExceeded",
            Self::SiblingFailed => "SiblingFailed",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One entry of the append-only condition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Condition type written by this controller.
    pub const READY: &'static str = "Ready";

    /// A `Ready` condition describing a phase change.
    pub fn ready(
        phase: Phase,
        reason: ConditionReason,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let status = if phase == Phase::Completed {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        Self {
            type_: Self::READY.to_string(),
            status,
            last_transition_time: at,
            reason,
            message: message.into(),
        }
    }
}

/// ML task served by the ML Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlTask {
    #[default]
    FeatureSelection,
    HyperparameterTuning,
    DistributedTraining,
}

impl fmt::Display for MlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureSelection => write!(f, "feature_selection"),
            Self::HyperparameterTuning => write!(f, "hyperparameter_tuning"),
            Self::DistributedTraining => write!(f, "distributed_training"),
        }
    }
}

/// Execution framework for ML tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlFramework {
    #[default]
    Sklearn,
    Dask,
    Spark,
    Ray,
}

impl fmt::Display for MlFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sklearn => write!(f, "sklearn"),
            Self::Dask => write!(f, "dask"),
            Self::Spark => write!(f, "spark"),
            Self::Ray => write!(f, "ray"),
        }
    }
}

/// ML-specific configuration block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlConfig {
    #[serde(default)]
    pub task: MlTask,
    #[serde(default)]
    pub framework: MlFramework,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_features: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_select: Option<u32>,
    /// Model family for tuning and training tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Selection method for feature selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl MlConfig {
    /// Dataset size, falling back to the task default.
    pub fn dataset_size_or_default(&self) -> u64 {
        self.dataset_size.unwrap_or(match self.task {
            MlTask::FeatureSelection => 10_000,
            MlTask::HyperparameterTuning => 5_000,
            MlTask::DistributedTraining => 100_000,
        })
    }

    /// Feature count, falling back to the task default.
    pub fn n_features_or_default(&self) -> u32 {
        self.n_features.unwrap_or(match self.task {
            MlTask::FeatureSelection | MlTask::DistributedTraining => 100,
            MlTask::HyperparameterTuning => 50,
        })
    }

    /// Number of features to select.
    pub fn n_select_or_default(&self) -> u32 {
        self.n_select.unwrap_or(20)
    }

    /// Model family, falling back to `random_forest`.
    pub fn algorithm_or_default(&self) -> &str {
        self.algorithm.as_deref().unwrap_or("random_forest")
    }

    /// Feature selection method, falling back to `filter`.
    pub fn method_or_default(&self) -> &str {
        self.method.as_deref().unwrap_or("filter")
    }
}

/// Environment variable for a custom container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Container resource requests and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

fn default_image() -> String {
    "alpine:latest".to_string()
}

fn default_command() -> Vec<String> {
    vec!["echo".to_string()]
}

fn default_args() -> Vec<String> {
    vec!["Hello World".to_string()]
}

/// Custom container configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Default for CustomConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: default_command(),
            args: default_args(),
            env: Vec::new(),
            resources: ResourceRequirements::default(),
        }
    }
}

/// A selected feature, reported either by column index or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Feature {
    Index(u64),
    Name(String),
}

/// ML-specific part of the results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_features: Option<Vec<Feature>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
}

/// Measurements of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingResults {
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    /// Peak memory in MB.
    #[serde(default)]
    pub memory_usage: f64,
    /// CPU utilisation in percent.
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Algorithm-specific metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metrics: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_results: Option<MlResults>,
}

const fn default_iterations() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Pending.can_transition_to(Phase::Running));
        assert!(Phase::Pending.can_transition_to(Phase::Completed));
        assert!(Phase::Pending.can_transition_to(Phase::Failed));
        assert!(Phase::Running.can_transition_to(Phase::Running));
        assert!(Phase::Running.can_transition_to(Phase::Failed));
        assert!(!Phase::Running.can_transition_to(Phase::Pending));
        assert!(!Phase::Completed.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Failed));
    }

    #[test]
    fn test_unknown_reason_reads_back() -> std::result::Result<(), serde_json::Error> {
        let reason: ConditionReason = serde_json::from_str("\"SomethingElse\"")?;
        assert_eq!(reason, ConditionReason::Unknown);
        Ok(())
    }

    #[test]
    fn test_ready_condition_status() {
        let now = Utc::now();
        let done = Condition::ready(Phase::Completed, ConditionReason::Completed, "", now);
        let failed = Condition::ready(Phase::Failed, ConditionReason::TimeoutExceeded, "", now);
        assert_eq!(done.status, ConditionStatus::True);
        assert_eq!(failed.status, ConditionStatus::False);
        assert_eq!(done.type_, "Ready");
    }

    #[test]
    fn test_ml_defaults_per_task() {
        let tuning = MlConfig {
            task: MlTask::HyperparameterTuning,
            ..MlConfig::default()
        };
        assert_eq!(tuning.dataset_size_or_default(), 5_000);
        assert_eq!(tuning.n_features_or_default(), 50);
        assert_eq!(tuning.algorithm_or_default(), "random_forest");

        let selection = MlConfig::default();
        assert_eq!(selection.dataset_size_or_default(), 10_000);
        assert_eq!(selection.n_select_or_default(), 20);
        assert_eq!(selection.method_or_default(), "filter");
    }

    #[test]
    fn test_selected_features_accept_indices_and_names() -> std::result::Result<(), serde_json::Error>
    {
        let ml: MlResults = serde_json::from_str(r#"{"selectedFeatures":[3,"age"]}"#)?;
        assert_eq!(
            ml.selected_features,
            Some(vec![Feature::Index(3), Feature::Name("age".to_string())])
        );
        Ok(())
    }
}
