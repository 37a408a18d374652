//! Compute Cluster: native batch jobs for arbitrary containers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use dprof_resources::{CustomConfig, EnvVar, JobHandle, ResourceRequirements};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::profiling::JobProgress;

const BACKEND: &str = "compute-cluster";

/// Container job to run for a custom-class resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJobSpec {
    /// Name of the owning resource; used for the job name prefix and labels.
    pub resource_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

impl BatchJobSpec {
    /// Job spec for a resource's custom config.
    pub fn from_config(resource_name: impl Into<String>, config: &CustomConfig) -> Self {
        Self {
            resource_name: resource_name.into(),
            image: config.image.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            resources: config.resources.clone(),
        }
    }

    fn labels(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("app", "dprofiler".to_string()),
            ("type", "custom-algorithm".to_string()),
            ("algorithm", self.resource_name.clone()),
        ])
    }

    /// `batch/v1` Job manifest.
    pub fn manifest(&self) -> serde_json::Value {
        let labels = self.labels();
        serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "generateName": format!("dprofiler-{}-", self.resource_name),
                "labels": labels,
            },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "algorithm",
                            "image": self.image,
                            "command": self.command,
                            "args": self.args,
                            "env": self.env,
                            "resources": self.resources,
                        }],
                    },
                },
            },
        })
    }
}

/// Observed state of a batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJobStatus {
    pub progress: JobProgress,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl BatchJobStatus {
    /// Wall-clock run time in seconds, when both timestamps are known.
    pub fn execution_time_secs(&self) -> Option<f64> {
        let (start, end) = (self.start_time?, self.completion_time?);
        let millis = end.signed_duration_since(start).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        Some(millis as f64 / 1000.0)
    }
}

/// Cluster batch-job primitive.
#[async_trait]
pub trait ComputeCluster: Send + Sync {
    /// Create a job; the returned handle is the generated job name.
    async fn create_batch_job(&self, spec: &BatchJobSpec) -> Result<JobHandle>;

    /// Query job state.
    async fn batch_job_status(&self, handle: &JobHandle) -> Result<BatchJobStatus>;

    /// Delete a job and its pods.
    async fn delete_batch_job(&self, handle: &JobHandle) -> Result<()>;
}

#[derive(Deserialize)]
struct JobObject {
    metadata: JobMeta,
    #[serde(default)]
    status: JobObjectStatus,
}

#[derive(Deserialize)]
struct JobMeta {
    name: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobObjectStatus {
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

impl From<JobObjectStatus> for BatchJobStatus {
    fn from(status: JobObjectStatus) -> Self {
        let progress = if status.succeeded > 0 {
            JobProgress::Succeeded
        } else if status.failed > 0 {
            let message = status
                .conditions
                .iter()
                .find(|c| c.kind == "Failed")
                .and_then(|c| c.message.clone())
                .unwrap_or_else(|| "Custom job failed".to_string());
            JobProgress::Failed { message }
        } else if status.start_time.is_some() {
            JobProgress::Running
        } else {
            JobProgress::Pending
        };
        Self {
            progress,
            start_time: status.start_time,
            completion_time: status.completion_time,
        }
    }
}

/// HTTP client for Kubernetes `batch/v1` Jobs.
pub struct HttpComputeCluster {
    client: Client,
    config: EndpointConfig,
    namespace: String,
}

impl HttpComputeCluster {
    /// Create a client that manages jobs in `namespace`.
    pub fn new(config: EndpointConfig, namespace: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: config.client()?,
            config,
            namespace: namespace.into(),
        })
    }

    fn jobs_url(&self) -> String {
        self.config
            .url(&format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace))
    }

    async fn send(&self, request: reqwest::RequestBuilder, handle: Option<&JobHandle>) -> Result<Response> {
        let request = match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::from_reqwest(BACKEND, &e))?;

        let status = response.status();
        match (status, handle) {
            (s, _) if s.is_success() => Ok(response),
            (StatusCode::NOT_FOUND, Some(handle)) => Err(Error::not_found(BACKEND, handle)),
            _ => Err(Error::Rejected {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl ComputeCluster for HttpComputeCluster {
    async fn create_batch_job(&self, spec: &BatchJobSpec) -> Result<JobHandle> {
        let request = self.client.post(self.jobs_url()).json(&spec.manifest());
        let created: JobObject = self
            .send(request, None)
            .await?
            .json()
            .await
            .map_err(|e| Error::invalid_response(BACKEND, e.to_string()))?;
        debug!(job = %created.metadata.name, resource = %spec.resource_name, "batch job created");
        Ok(JobHandle::new(created.metadata.name))
    }

    async fn batch_job_status(&self, handle: &JobHandle) -> Result<BatchJobStatus> {
        let url = format!("{}/{handle}", self.jobs_url());
        let job: JobObject = self
            .send(self.client.get(url), Some(handle))
            .await?
            .json()
            .await
            .map_err(|e| Error::invalid_response(BACKEND, e.to_string()))?;
        Ok(job.status.into())
    }

    async fn delete_batch_job(&self, handle: &JobHandle) -> Result<()> {
        let url = format!("{}/{handle}", self.jobs_url());
        let request = self
            .client
            .delete(url)
            .query(&[("propagationPolicy", "Background")]);
        self.send(request, Some(handle)).await?;
        Ok(())
    }
}
