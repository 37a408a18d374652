//! In-memory backends for tests and local runs.
//!
//! Every fake hands out sequential handles (`J1`, `J2`, ...), follows a
//! script keyed by algorithm or resource name, and records every call so
//! tests can assert on exactly what the controller asked for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use dprof_resources::{Feature, JobHandle, MlResults, MlTask, ProfilingResults};

use crate::cluster::{BatchJobSpec, BatchJobStatus, ComputeCluster};
use crate::error::{Error, Result};
use crate::ml::{MlOutcome, MlRequest, MlService};
use crate::profiling::{JobProgress, JobRequest, ProfilingService};

/// Scripted behaviour of a fake job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScript {
    /// Report Running for `after_polls` status queries, then Succeeded.
    Succeed { after_polls: u32 },
    /// Report Running for `after_polls` status queries, then Failed.
    Fail { after_polls: u32, message: String },
    /// Stay Running forever.
    Never,
    /// Refuse creation.
    RejectCreate { message: String },
}

impl Default for JobScript {
    fn default() -> Self {
        Self::Succeed { after_polls: 1 }
    }
}

impl JobScript {
    fn progress(&self, polls: u32) -> JobProgress {
        match self {
            Self::Succeed { after_polls } if polls > *after_polls => JobProgress::Succeeded,
            Self::Fail {
                after_polls,
                message,
            } if polls > *after_polls => JobProgress::Failed {
                message: message.clone(),
            },
            _ => JobProgress::Running,
        }
    }
}

#[derive(Debug)]
struct FakeJob {
    name: String,
    script: JobScript,
    polls: u32,
    deleted: bool,
}

#[derive(Default)]
struct JobTable {
    next_id: u64,
    scripts: HashMap<String, JobScript>,
    jobs: HashMap<JobHandle, FakeJob>,
    poll_errors: u32,
    create_delay: Option<Duration>,
}

impl JobTable {
    fn script_for(&self, name: &str) -> JobScript {
        self.scripts.get(name).cloned().unwrap_or_default()
    }

    fn insert(&mut self, name: &str) -> Result<JobHandle> {
        let script = self.script_for(name);
        if let JobScript::RejectCreate { message } = script {
            return Err(Error::Rejected {
                backend: "fake".to_string(),
                status: 400,
                body: message,
            });
        }
        self.next_id = self.next_id.saturating_add(1);
        let handle = JobHandle::new(format!("J{}", self.next_id));
        self.jobs.insert(
            handle.clone(),
            FakeJob {
                name: name.to_string(),
                script,
                polls: 0,
                deleted: false,
            },
        );
        Ok(handle)
    }

    fn poll(&mut self, backend: &str, handle: &JobHandle) -> Result<JobProgress> {
        if self.poll_errors > 0 {
            self.poll_errors = self.poll_errors.saturating_sub(1);
            return Err(Error::unavailable(backend, "injected poll failure"));
        }
        let job = self
            .jobs
            .get_mut(handle)
            .filter(|job| !job.deleted)
            .ok_or_else(|| Error::not_found(backend, handle))?;
        job.polls = job.polls.saturating_add(1);
        Ok(job.script.progress(job.polls))
    }

    fn delete(&mut self, backend: &str, handle: &JobHandle) -> Result<()> {
        match self.jobs.get_mut(handle) {
            Some(job) if !job.deleted => {
                job.deleted = true;
                Ok(())
            }
            _ => Err(Error::not_found(backend, handle)),
        }
    }
}

fn sample_results() -> ProfilingResults {
    ProfilingResults {
        execution_time: 0.42,
        memory_usage: 12.5,
        cpu_usage: 87.0,
        iterations: 1,
        ..ProfilingResults::default()
    }
}

#[derive(Default)]
struct ProfilingLog {
    created: Vec<JobRequest>,
    polled: Vec<JobHandle>,
    deleted: Vec<JobHandle>,
}

/// Fake Profiling Service.
#[derive(Default)]
pub struct InMemoryProfilingService {
    table: RwLock<JobTable>,
    results: RwLock<HashMap<String, Vec<ProfilingResults>>>,
    log: RwLock<ProfilingLog>,
}

impl InMemoryProfilingService {
    /// Create a service where every job succeeds after one poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared service.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Script jobs created for `algorithm_name`.
    pub async fn script(&self, algorithm_name: impl Into<String>, script: JobScript) {
        self.table
            .write()
            .await
            .scripts
            .insert(algorithm_name.into(), script);
    }

    /// Results reported for `algorithm_name` jobs.
    pub async fn set_results(&self, algorithm_name: impl Into<String>, results: Vec<ProfilingResults>) {
        self.results
            .write()
            .await
            .insert(algorithm_name.into(), results);
    }

    /// Fail the next `n` status queries as unavailable.
    pub async fn inject_poll_errors(&self, n: u32) {
        self.table.write().await.poll_errors = n;
    }

    /// Delay every job creation.
    pub async fn set_create_delay(&self, delay: Duration) {
        self.table.write().await.create_delay = Some(delay);
    }

    /// Creation requests in call order.
    pub async fn created(&self) -> Vec<JobRequest> {
        self.log.read().await.created.clone()
    }

    /// Handles passed to status queries, in call order.
    pub async fn polled(&self) -> Vec<JobHandle> {
        self.log.read().await.polled.clone()
    }

    /// Handles passed to delete, in call order.
    pub async fn deleted(&self) -> Vec<JobHandle> {
        self.log.read().await.deleted.clone()
    }
}

#[async_trait]
impl ProfilingService for InMemoryProfilingService {
    async fn create_job(&self, request: &JobRequest) -> Result<JobHandle> {
        self.log.write().await.created.push(request.clone());
        let delay = self.table.read().await.create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.table.write().await.insert(&request.algorithm_name)
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<JobProgress> {
        self.log.write().await.polled.push(handle.clone());
        self.table.write().await.poll("profiling-service", handle)
    }

    async fn job_results(&self, handle: &JobHandle) -> Result<Vec<ProfilingResults>> {
        let name = {
            let table = self.table.read().await;
            let job = table
                .jobs
                .get(handle)
                .filter(|job| !job.deleted)
                .ok_or_else(|| Error::not_found("profiling-service", handle))?;
            job.name.clone()
        };
        Ok(self
            .results
            .read()
            .await
            .get(&name)
            .cloned()
            .unwrap_or_else(|| vec![sample_results()]))
    }

    async fn delete_job(&self, handle: &JobHandle) -> Result<()> {
        self.log.write().await.deleted.push(handle.clone());
        self.table.write().await.delete("profiling-service", handle)
    }
}

/// Fake ML Service.
#[derive(Default)]
pub struct InMemoryMlService {
    calls: RwLock<Vec<MlRequest>>,
    failure: RwLock<Option<String>>,
}

impl InMemoryMlService {
    /// Create a service where every task completes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared service.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every following call fail with `message`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }

    /// Requests in call order.
    pub async fn calls(&self) -> Vec<MlRequest> {
        self.calls.read().await.clone()
    }
}

fn ml_results(request: &MlRequest) -> MlResults {
    let framework = Some(request.framework.to_string());
    match request.task {
        MlTask::FeatureSelection => MlResults {
            accuracy: Some(0.91),
            selected_features: Some(
                (0..u64::from(request.n_select.min(request.n_features)))
                    .map(Feature::Index)
                    .collect(),
            ),
            best_params: None,
            framework,
        },
        MlTask::HyperparameterTuning => MlResults {
            accuracy: Some(0.88),
            selected_features: None,
            best_params: Some(serde_json::json!({"n_estimators": 100, "max_depth": 8})),
            framework,
        },
        MlTask::DistributedTraining => MlResults {
            accuracy: Some(0.9),
            selected_features: None,
            best_params: None,
            framework,
        },
    }
}

#[async_trait]
impl MlService for InMemoryMlService {
    async fn run(&self, request: &MlRequest) -> Result<MlOutcome> {
        let id = {
            let mut calls = self.calls.write().await;
            calls.push(request.clone());
            calls.len()
        };
        if let Some(message) = self.failure.read().await.clone() {
            return Err(Error::Rejected {
                backend: "ml-service".to_string(),
                status: 500,
                body: message,
            });
        }
        Ok(MlOutcome {
            handle: JobHandle::new(format!("J{id}")),
            results: ProfilingResults {
                execution_time: 1.5,
                memory_usage: 256.0,
                cpu_usage: 75.0,
                iterations: request.iterations,
                metrics: serde_json::Map::new(),
                ml_results: Some(ml_results(request)),
            },
        })
    }
}

#[derive(Default)]
struct ClusterLog {
    created: Vec<BatchJobSpec>,
    polled: Vec<JobHandle>,
    deleted: Vec<JobHandle>,
}

/// Fake Compute Cluster.
#[derive(Default)]
pub struct InMemoryComputeCluster {
    table: RwLock<JobTable>,
    log: RwLock<ClusterLog>,
}

impl InMemoryComputeCluster {
    /// Create a cluster where every job succeeds after one poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared cluster.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Script jobs created for `resource_name`.
    pub async fn script(&self, resource_name: impl Into<String>, script: JobScript) {
        self.table
            .write()
            .await
            .scripts
            .insert(resource_name.into(), script);
    }

    /// Job specs in call order.
    pub async fn created(&self) -> Vec<BatchJobSpec> {
        self.log.read().await.created.clone()
    }

    /// Handles passed to status queries, in call order.
    pub async fn polled(&self) -> Vec<JobHandle> {
        self.log.read().await.polled.clone()
    }

    /// Handles passed to delete, in call order.
    pub async fn deleted(&self) -> Vec<JobHandle> {
        self.log.read().await.deleted.clone()
    }
}

#[async_trait]
impl ComputeCluster for InMemoryComputeCluster {
    async fn create_batch_job(&self, spec: &BatchJobSpec) -> Result<JobHandle> {
        self.log.write().await.created.push(spec.clone());
        self.table.write().await.insert(&spec.resource_name)
    }

    async fn batch_job_status(&self, handle: &JobHandle) -> Result<BatchJobStatus> {
        self.log.write().await.polled.push(handle.clone());
        let progress = self.table.write().await.poll("compute-cluster", handle)?;
        let now = Utc::now();
        let start_time = now.checked_sub_signed(chrono::Duration::milliseconds(1500));
        let completion_time = progress.is_terminal().then_some(now);
        Ok(BatchJobStatus {
            progress,
            start_time,
            completion_time,
        })
    }

    async fn delete_batch_job(&self, handle: &JobHandle) -> Result<()> {
        self.log.write().await.deleted.push(handle.clone());
        self.table.write().await.delete("compute-cluster", handle)
    }
}
