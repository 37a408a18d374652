//! Operator configuration.
//!
//! Resolution order, later wins: built-in defaults, the TOML file given with
//! `--config`, environment variables, command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use dprof_backends::config::duration_secs;
use dprof_backends::{DEFAULT_API_URL, DEFAULT_CLUSTER_URL, DEFAULT_REQUEST_TIMEOUT, EndpointConfig};
use dprof_reconciler::ReconcilerConfig;
use dprof_store::WatcherConfig;

/// Environment variable naming the namespace to watch.
pub const ENV_NAMESPACE: &str = "WATCH_NAMESPACE";
/// Environment variable for the Profiling Service URL.
pub const ENV_API_URL: &str = "DPROFILER_API_URL";
/// Environment variable for the ML Service URL.
pub const ENV_ML_API_URL: &str = "DPROFILER_ML_API_URL";
/// Environment variable for the API server URL.
pub const ENV_KUBERNETES_API_URL: &str = "KUBERNETES_API_URL";
/// Environment variable for the poll interval in seconds.
pub const ENV_POLL_INTERVAL: &str = "DPROFILER_POLL_INTERVAL_SECS";
/// Environment variable for the reconcile concurrency bound.
pub const ENV_MAX_CONCURRENT: &str = "DPROFILER_MAX_CONCURRENT_RECONCILES";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl ConfigError {
    fn env(var: &str, reason: impl Into<String>) -> Self {
        Self::Env {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where resources are stored and custom jobs run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    pub url: String,
    /// File holding the bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    /// PEM file of an extra trusted CA.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl ApiServerConfig {
    /// Parsed server URL.
    pub fn parsed_url(&self) -> Result<Url> {
        parse_url("api_server.url", &self.url)
    }
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CLUSTER_URL.to_string(),
            token_file: None,
            ca_cert_file: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// An HTTP backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub url: String,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ServiceConfig {
    /// Client settings for this service.
    pub fn endpoint(&self) -> Result<EndpointConfig> {
        let url = parse_url("url", &self.url)?;
        Ok(EndpointConfig::new(url).with_timeout(self.request_timeout))
    }
}

/// Watch connection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    /// Seconds between forced re-lists; 0 disables them.
    #[serde(with = "duration_secs")]
    pub resync_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Everything the operator needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace to watch.
    pub namespace: String,
    pub log: LogConfig,
    pub api_server: ApiServerConfig,
    pub profiling_service: ServiceConfig,
    pub ml_service: ServiceConfig,
    pub reconciler: ReconcilerConfig,
    pub watch: WatchConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            log: LogConfig::default(),
            api_server: ApiServerConfig::default(),
            profiling_service: ServiceConfig::default(),
            ml_service: ServiceConfig::default(),
            reconciler: ReconcilerConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| ConfigError::Invalid(format!("{field} '{value}': {e}")))
}

fn env_url(var: &str, value: &str) -> Result<String> {
    let value = value.trim();
    Url::parse(value).map_err(|e| ConfigError::env(var, e.to_string()))?;
    Ok(value.to_string())
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::env(var, e.to_string()))
}

impl OperatorConfig {
    /// Defaults, or the contents of `path` laid over them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    pub fn with_process_env(self) -> Result<Self> {
        self.with_env(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.namespace = namespace.trim().to_string();
        }
        if let Some(url) = lookup(ENV_API_URL) {
            self.profiling_service.url = env_url(ENV_API_URL, &url)?;
            // The ML endpoints live on the same service unless told otherwise.
            if lookup(ENV_ML_API_URL).is_none() {
                self.ml_service.url = self.profiling_service.url.clone();
            }
        }
        if let Some(url) = lookup(ENV_ML_API_URL) {
            self.ml_service.url = env_url(ENV_ML_API_URL, &url)?;
        }
        if let Some(url) = lookup(ENV_KUBERNETES_API_URL) {
            self.api_server.url = env_url(ENV_KUBERNETES_API_URL, &url)?;
        }
        if let Some(secs) = lookup(ENV_POLL_INTERVAL) {
            let secs: u64 = parse_number(ENV_POLL_INTERVAL, &secs)?;
            self.reconciler.poll_interval = Duration::from_secs(secs);
        }
        if let Some(max) = lookup(ENV_MAX_CONCURRENT) {
            self.reconciler.max_concurrent_reconciles = parse_number(ENV_MAX_CONCURRENT, &max)?;
        }
        Ok(self)
    }

    /// Reject settings the operator cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_string()));
        }
        if self.watch.initial_backoff.is_zero() || self.watch.max_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "watch backoff bounds must be non-zero".to_string(),
            ));
        }
        if self.watch.initial_backoff > self.watch.max_backoff {
            return Err(ConfigError::Invalid(
                "watch initial_backoff must not exceed max_backoff".to_string(),
            ));
        }
        for (name, url, timeout) in [
            ("api_server", &self.api_server.url, self.api_server.request_timeout),
            ("profiling_service", &self.profiling_service.url, self.profiling_service.request_timeout),
            ("ml_service", &self.ml_service.url, self.ml_service.request_timeout),
        ] {
            parse_url(&format!("{name}.url"), url)?;
            if timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.request_timeout must be non-zero"
                )));
            }
        }
        self.reconciler
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Watcher settings for the configured namespace.
    pub fn watcher(&self) -> WatcherConfig {
        let resync = (!self.watch.resync_interval.is_zero()).then_some(self.watch.resync_interval);
        WatcherConfig::new(self.namespace.clone())
            .with_backoff(self.watch.initial_backoff, self.watch.max_backoff)
            .with_resync_interval(resync)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() -> TestResult {
        let config = OperatorConfig::default();
        config.validate()?;
        assert_eq!(config.namespace, "default");
        assert_eq!(config.profiling_service.url, "http://dprofiler-api-service:8000");
        assert_eq!(config.reconciler.poll_interval, Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn test_load_from_file() -> TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
namespace = "profiling"

[log]
json = true

[profiling_service]
url = "http://profiler.local:9000"
request_timeout = 5

[reconciler]
poll_interval = 2
max_concurrent_reconciles = 4

[watch]
resync_interval = 0
"#
        )?;

        let config = OperatorConfig::load(Some(file.path()))?;
        assert_eq!(config.namespace, "profiling");
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.profiling_service.url, "http://profiler.local:9000");
        assert_eq!(config.profiling_service.request_timeout, Duration::from_secs(5));
        assert_eq!(config.reconciler.poll_interval, Duration::from_secs(2));
        assert_eq!(config.reconciler.max_concurrent_reconciles, 4);
        assert_eq!(config.reconciler.status_patch_attempts, 3);
        assert_eq!(config.watcher().resync_interval, None);
        assert_eq!(config.watcher().namespace, "profiling");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = OperatorConfig::load(Some(Path::new("/nonexistent/dprof.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_malformed_file_is_an_error() -> TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "namespace = [")?;
        let result = OperatorConfig::load(Some(file.path()));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
        Ok(())
    }

    #[test]
    fn test_env_overrides() -> TestResult {
        let config = OperatorConfig::default().with_env(env(&[
            (ENV_NAMESPACE, "team-a"),
            (ENV_API_URL, "http://api.team-a:8000"),
            (ENV_KUBERNETES_API_URL, "https://10.0.0.1:6443"),
            (ENV_POLL_INTERVAL, "3"),
            (ENV_MAX_CONCURRENT, "32"),
        ]))?;

        assert_eq!(config.namespace, "team-a");
        assert_eq!(config.profiling_service.url, "http://api.team-a:8000");
        assert_eq!(config.ml_service.url, config.profiling_service.url);
        assert_eq!(config.api_server.url, "https://10.0.0.1:6443");
        assert_eq!(config.reconciler.poll_interval, Duration::from_secs(3));
        assert_eq!(config.reconciler.max_concurrent_reconciles, 32);
        Ok(())
    }

    #[test]
    fn test_ml_url_overrides_separately() -> TestResult {
        let config = OperatorConfig::default().with_env(env(&[
            (ENV_API_URL, "http://api:8000"),
            (ENV_ML_API_URL, "http://ml:8001"),
        ]))?;
        assert_eq!(config.profiling_service.url, "http://api:8000");
        assert_eq!(config.ml_service.url, "http://ml:8001");
        Ok(())
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        let bad_number =
            OperatorConfig::default().with_env(env(&[(ENV_POLL_INTERVAL, "soon")]));
        assert!(matches!(bad_number, Err(ConfigError::Env { ref var, .. }) if var == ENV_POLL_INTERVAL));

        let bad_url = OperatorConfig::default().with_env(env(&[(ENV_API_URL, "not a url")]));
        assert!(matches!(bad_url, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = OperatorConfig::default();
        config.namespace = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.reconciler.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.reconciler.max_concurrent_reconciles = 0;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.watch.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.ml_service.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rendered_toml_loads_back() -> TestResult {
        let mut config = OperatorConfig::default();
        config.namespace = "bench".to_string();
        config.api_server.token_file = Some(PathBuf::from("/var/run/token"));

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(config.to_toml()?.as_bytes())?;
        assert_eq!(OperatorConfig::load(Some(file.path()))?, config);
        Ok(())
    }
}
