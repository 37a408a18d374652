//! Assembles the controller from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use dprof_backends::{Backends, EndpointConfig};
use dprof_reconciler::Controller;
use dprof_resources::{ProfilingComparison, ProfilingRequest};
use dprof_store::{HttpResourceStore, HttpStoreConfig};

use crate::config::OperatorConfig;

/// Credentials for the API server.
struct ApiCredentials {
    token: Option<String>,
    ca_cert_pem: Option<Vec<u8>>,
}

impl ApiCredentials {
    fn load(config: &OperatorConfig) -> Result<Self> {
        let token = match &config.api_server.token_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read token file {}", path.display()))?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        let ca_cert_pem = match &config.api_server.ca_cert_file {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read CA file {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { token, ca_cert_pem })
    }

    fn store_config(&self, config: &OperatorConfig) -> Result<HttpStoreConfig> {
        let mut store = HttpStoreConfig::new(config.api_server.parsed_url()?)
            .with_request_timeout(config.api_server.request_timeout);
        if let Some(token) = &self.token {
            store = store.with_token(token.clone());
        }
        if let Some(pem) = &self.ca_cert_pem {
            store = store.with_ca_cert(pem.clone());
        }
        Ok(store)
    }

    fn cluster_endpoint(&self, config: &OperatorConfig) -> Result<EndpointConfig> {
        let mut endpoint = EndpointConfig::new(config.api_server.parsed_url()?)
            .with_timeout(config.api_server.request_timeout);
        if let Some(token) = &self.token {
            endpoint = endpoint.with_token(token.clone());
        }
        if let Some(pem) = &self.ca_cert_pem {
            endpoint = endpoint.with_ca_cert(pem.clone());
        }
        Ok(endpoint)
    }
}

/// Build a controller talking to the configured API server and services.
pub fn build_controller(config: &OperatorConfig) -> Result<Controller> {
    let credentials = ApiCredentials::load(config)?;
    let store_config = credentials.store_config(config)?;

    let requests = HttpResourceStore::<ProfilingRequest>::new(store_config.clone())
        .context("failed to build AlgorithmProfiling store")?;
    let comparisons = HttpResourceStore::<ProfilingComparison>::new(store_config)
        .context("failed to build AlgorithmComparison store")?;

    let backends = Backends::http(
        config.profiling_service.endpoint()?,
        config.ml_service.endpoint()?,
        credentials.cluster_endpoint(config)?,
        &config.namespace,
    )
    .context("failed to build backend clients")?;

    Controller::new(
        Arc::new(requests),
        Arc::new(comparisons),
        backends,
        config.reconciler.clone(),
        config.watcher(),
    )
    .context("invalid reconciler configuration")
}

/// Run the operator until `shutdown` turns true.
pub async fn run(config: &OperatorConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let controller = build_controller(config)?;
    info!(
        namespace = %config.namespace,
        api_server = %config.api_server.url,
        profiling_service = %config.profiling_service.url,
        ml_service = %config.ml_service.url,
        "operator configured"
    );
    controller.run(shutdown).await.context("controller failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_builds_from_defaults() -> TestResult {
        build_controller(&OperatorConfig::default())?;
        Ok(())
    }

    #[test]
    fn test_reads_token_file() -> TestResult {
        let mut token = tempfile::NamedTempFile::new()?;
        writeln!(token, "secret-token")?;
        let mut config = OperatorConfig::default();
        config.api_server.token_file = Some(token.path().to_path_buf());

        let credentials = ApiCredentials::load(&config)?;
        assert_eq!(credentials.token.as_deref(), Some("secret-token"));
        let endpoint = credentials.cluster_endpoint(&config)?;
        assert_eq!(endpoint.token.as_deref(), Some("secret-token"));
        Ok(())
    }

    #[test]
    fn test_missing_token_file_fails() {
        let mut config = OperatorConfig::default();
        config.api_server.token_file = Some(PathBuf::from("/nonexistent/token"));
        assert!(build_controller(&config).is_err());
    }
}
