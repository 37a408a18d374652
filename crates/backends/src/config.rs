//! Backend client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Default Profiling Service and ML Service address.
pub const DEFAULT_API_URL: &str = "http://dprofiler-api-service:8000";

/// Default in-cluster API server address.
pub const DEFAULT_CLUSTER_URL: &str = "https://kubernetes.default.svc";

/// Default per-request timeout for every backend call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for one HTTP backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL.
    pub base_url: Url,
    /// Whole-request timeout; calls are never retried by the client.
    #[serde(with = "duration_secs", default = "default_timeout")]
    pub request_timeout: Duration,
    /// Bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// PEM bundle of an extra trusted CA.
    #[serde(skip)]
    pub ca_cert_pem: Option<Vec<u8>>,
}

const fn default_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl EndpointConfig {
    /// Settings for `base_url` with the default timeout.
    pub const fn new(base_url: Url) -> Self {
        Self {
            base_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            token: None,
            ca_cert_pem: None,
        }
    }

    /// Parse `url` into settings with the default timeout.
    pub fn parse(url: &str) -> Result<Self> {
        Url::parse(url)
            .map(Self::new)
            .map_err(|e| Error::Config(format!("invalid URL '{url}': {e}")))
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Trust an extra CA certificate.
    #[must_use]
    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert_pem = Some(pem);
        self
    }

    /// Join `path` onto the base URL, keeping any base path prefix.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Build a reqwest client with the configured timeout.
    pub fn client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.request_timeout);
        if let Some(pem) = &self.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
    }
}

/// Duration serialization as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_keeps_prefix() -> Result<()> {
        let config = EndpointConfig::parse("http://gateway/dprofiler/")?;
        assert_eq!(config.url("/api/v1/jobs"), "http://gateway/dprofiler/api/v1/jobs");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(EndpointConfig::parse("not a url").is_err());
    }

    #[test]
    fn test_default_timeout() -> Result<()> {
        let config = EndpointConfig::parse(DEFAULT_API_URL)?;
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        Ok(())
    }
}
