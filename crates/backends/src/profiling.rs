//! Profiling Service: the asynchronous job backend for built-in algorithms.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use dprof_resources::{JobHandle, ProfilingResults};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};

const BACKEND: &str = "profiling-service";

/// Progress of a backend job as reported by a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobProgress {
    /// Accepted but not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully; results can be fetched.
    Succeeded,
    /// Finished unsuccessfully.
    Failed { message: String },
}

impl JobProgress {
    /// Check if the job has finished.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Job creation request for a built-in algorithm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    pub algorithm_name: String,
    pub input_size: u64,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub priority: i32,
}

/// Bookkeeping service for asynchronous profiling jobs.
#[async_trait]
pub trait ProfilingService: Send + Sync {
    /// Create a job; the returned handle identifies it from now on.
    async fn create_job(&self, request: &JobRequest) -> Result<JobHandle>;

    /// Query job progress.
    async fn job_status(&self, handle: &JobHandle) -> Result<JobProgress>;

    /// Fetch the results of a succeeded job.
    async fn job_results(&self, handle: &JobHandle) -> Result<Vec<ProfilingResults>>;

    /// Delete a job and its results.
    async fn delete_job(&self, handle: &JobHandle) -> Result<()>;
}

#[derive(Deserialize)]
struct CreatedJob {
    job_id: String,
}

#[derive(Deserialize)]
struct JobRecord {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ResultRecord {
    execution_time: f64,
    #[serde(default)]
    memory_usage: f64,
    #[serde(default)]
    cpu_usage: f64,
    #[serde(default = "one")]
    iterations: u32,
    #[serde(default)]
    result_metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

const fn one() -> u32 {
    1
}

impl From<ResultRecord> for ProfilingResults {
    fn from(record: ResultRecord) -> Self {
        Self {
            execution_time: record.execution_time,
            memory_usage: record.memory_usage,
            cpu_usage: record.cpu_usage,
            iterations: record.iterations,
            metrics: record.result_metadata.unwrap_or_default(),
            ml_results: None,
        }
    }
}

fn parse_progress(record: JobRecord) -> Result<JobProgress> {
    match record.status.as_str() {
        "pending" | "queued" => Ok(JobProgress::Pending),
        "running" => Ok(JobProgress::Running),
        "completed" => Ok(JobProgress::Succeeded),
        "failed" => Ok(JobProgress::Failed {
            message: record
                .error_message
                .unwrap_or_else(|| "Job failed".to_string()),
        }),
        "cancelled" => Ok(JobProgress::Failed {
            message: "Job was cancelled".to_string(),
        }),
        other => Err(Error::invalid_response(
            BACKEND,
            format!("unknown job status '{other}'"),
        )),
    }
}

/// HTTP client for the Profiling Service.
pub struct HttpProfilingService {
    client: Client,
    config: EndpointConfig,
}

impl HttpProfilingService {
    /// Create a client.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: config.client()?,
            config,
        })
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
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(handle) = handle {
                return Err(Error::not_found(BACKEND, handle));
            }
        }
        Err(Error::Rejected {
            backend: BACKEND.to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ProfilingService for HttpProfilingService {
    async fn create_job(&self, request: &JobRequest) -> Result<JobHandle> {
        let response = self
            .send(self.client.post(self.config.url("/api/v1/jobs")).json(request), None)
            .await?;
        let created: CreatedJob = response
            .json()
            .await
            .map_err(|e| Error::invalid_response(BACKEND, e.to_string()))?;
        debug!(job_id = %created.job_id, algorithm = %request.algorithm_name, "profiling job created");
        Ok(JobHandle::new(created.job_id))
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<JobProgress> {
        let url = self.config.url(&format!("/api/v1/jobs/{handle}"));
        let record: JobRecord = self
            .send(self.client.get(url), Some(handle))
            .await?
            .json()
            .await
            .map_err(|e| Error::invalid_response(BACKEND, e.to_string()))?;
        parse_progress(record)
    }

    async fn job_results(&self, handle: &JobHandle) -> Result<Vec<ProfilingResults>> {
        let url = self.config.url(&format!("/api/v1/jobs/{handle}/results"));
        let records: Vec<ResultRecord> = self
            .send(self.client.get(url), Some(handle))
            .await?
            .json()
            .await
            .map_err(|e| Error::invalid_response(BACKEND, e.to_string()))?;
        Ok(records.into_iter().map(ProfilingResults::from).collect())
    }

    async fn delete_job(&self, handle: &JobHandle) -> Result<()> {
        let url = self.config.url(&format!("/api/v1/jobs/{handle}"));
        self.send(self.client.delete(url), Some(handle)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: &str) -> JobRecord {
        JobRecord {
            status: status.to_string(),
            error_message: None,
        }
    }

    #[test]
    fn test_status_strings() -> Result<()> {
        assert_eq!(parse_progress(record("queued"))?, JobProgress::Pending);
        assert_eq!(parse_progress(record("running"))?, JobProgress::Running);
        assert_eq!(parse_progress(record("completed"))?, JobProgress::Succeeded);
        assert!(matches!(
            parse_progress(record("cancelled"))?,
            JobProgress::Failed { .. }
        ));
        assert!(parse_progress(record("exploded")).is_err());
        Ok(())
    }

    #[test]
    fn test_failed_keeps_backend_message() -> Result<()> {
        let progress = parse_progress(JobRecord {
            status: "failed".to_string(),
            error_message: Some("worker crashed".to_string()),
        })?;
        assert_eq!(
            progress,
            JobProgress::Failed {
                message: "worker crashed".to_string()
            }
        );
        assert!(progress.is_terminal());
        Ok(())
    }
}
