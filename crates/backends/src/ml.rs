//! ML Service: synchronous machine-learning task endpoints.
//!
//! Every call blocks until the task has run and answers with the final
//! metrics, so there is nothing to poll afterwards.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use dprof_resources::{
    Feature, JobHandle, MlConfig, MlFramework, MlResults, MlTask, ProfilingResults,
};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};

const BACKEND: &str = "ml-service";

/// A fully-defaulted ML task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlRequest {
    pub task: MlTask,
    pub framework: MlFramework,
    pub dataset_size: u64,
    pub n_features: u32,
    pub n_select: u32,
    pub algorithm: String,
    pub method: String,
    pub iterations: u32,
}

impl MlRequest {
    /// Resolve per-task defaults from a resource's ML config.
    pub fn from_config(config: &MlConfig, iterations: u32) -> Self {
        Self {
            task: config.task,
            framework: config.framework,
            dataset_size: config.dataset_size_or_default(),
            n_features: config.n_features_or_default(),
            n_select: config.n_select_or_default(),
            algorithm: config.algorithm_or_default().to_string(),
            method: config.method_or_default().to_string(),
            iterations,
        }
    }

    /// Endpoint path for the task.
    pub const fn path(&self) -> &'static str {
        match self.task {
            MlTask::FeatureSelection => "/api/v1/ml/feature-selection",
            MlTask::HyperparameterTuning => "/api/v1/ml/hyperparameter-tuning",
            MlTask::DistributedTraining => "/api/v1/ml/distributed-training",
        }
    }

    /// Request body for the task endpoint.
    pub fn body(&self) -> serde_json::Value {
        match self.task {
            MlTask::FeatureSelection => serde_json::json!({
                "method": self.method,
                "framework": self.framework,
                "dataset_size": self.dataset_size,
                "n_features": self.n_features,
                "n_select": self.n_select,
                "iterations": self.iterations,
            }),
            MlTask::HyperparameterTuning | MlTask::DistributedTraining => serde_json::json!({
                "algorithm": self.algorithm,
                "framework": self.framework,
                "dataset_size": self.dataset_size,
                "n_features": self.n_features,
                "iterations": self.iterations,
            }),
        }
    }
}

/// Final answer of a synchronous ML task.
#[derive(Debug, Clone, PartialEq)]
pub struct MlOutcome {
    pub handle: JobHandle,
    pub results: ProfilingResults,
}

/// Synchronous ML task runner.
#[async_trait]
pub trait MlService: Send + Sync {
    /// Run a task to completion.
    async fn run(&self, request: &MlRequest) -> Result<MlOutcome>;
}

#[derive(Debug, Deserialize)]
pub(crate) struct MlResponse {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub algorithm_name: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub best_score: Option<f64>,
    #[serde(default)]
    pub best_params: Option<serde_json::Value>,
    #[serde(default)]
    pub selected_features: Option<Vec<Feature>>,
    #[serde(default)]
    pub selected_features_count: Option<u64>,
}

impl MlResponse {
    pub(crate) fn into_outcome(self, iterations: u32) -> Result<MlOutcome> {
        if let Some(status) = self.status.as_deref() {
            if status != "completed" {
                return Err(Error::invalid_response(
                    BACKEND,
                    format!("task {} finished with status '{status}'", self.job_id),
                ));
            }
        }

        let mut metrics = serde_json::Map::new();
        if let Some(name) = self.algorithm_name {
            metrics.insert("algorithm_name".to_string(), name.into());
        }
        if let Some(score) = self.best_score {
            metrics.insert("best_score".to_string(), score.into());
        }
        if let Some(count) = self.selected_features_count {
            metrics.insert("selected_features_count".to_string(), count.into());
        }

        Ok(MlOutcome {
            handle: JobHandle::new(self.job_id),
            results: ProfilingResults {
                execution_time: self.execution_time,
                memory_usage: self.memory_usage,
                cpu_usage: self.cpu_usage,
                iterations,
                metrics,
                ml_results: Some(MlResults {
                    accuracy: self.accuracy,
                    selected_features: self.selected_features,
                    best_params: self.best_params,
                    framework: self.framework,
                }),
            },
        })
    }
}

/// HTTP client for the ML Service.
pub struct HttpMlService {
    client: Client,
    config: EndpointConfig,
}

impl HttpMlService {
    /// Create a client.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: config.client()?,
            config,
        })
    }
}

#[async_trait]
impl MlService for HttpMlService {
    async fn run(&self, request: &MlRequest) -> Result<MlOutcome> {
        let mut builder = self
            .client
            .post(self.config.url(request.path()))
            .json(&request.body());
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::from_reqwest(BACKEND, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rejected {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: MlResponse = response
            .json()
            .await
            .map_err(|e| Error::invalid_response(BACKEND, e.to_string()))?;
        debug!(job_id = %body.job_id, task = %request.task, "ML task finished");
        body.into_outcome(request.iterations)
    }
}
