//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::OperatorConfig;

/// dProfiler operator
#[derive(Parser, Debug)]
#[command(name = "dprof-operator")]
#[command(version)]
#[command(about = "Drives AlgorithmProfiling and AlgorithmComparison resources to completion")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "DPROF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace to watch (overrides config and WATCH_NAMESPACE)
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Log filter used when RUST_LOG is unset, e.g. "info" or "dprof_reconciler=debug"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the controller until interrupted
    Run,

    /// Print the resolved configuration as TOML
    Config,
}

impl Cli {
    /// Lay the command-line overrides over `config`.
    #[must_use]
    pub fn apply(&self, mut config: OperatorConfig) -> OperatorConfig {
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.log_json {
            config.log.json = true;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from([
            "dprof-operator",
            "run",
            "--namespace",
            "bench",
            "--log-level",
            "debug",
            "--log-json",
        ])?;
        assert_eq!(cli.command, Commands::Run);

        let config = cli.apply(OperatorConfig::default());
        assert_eq!(config.namespace, "bench");
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        Ok(())
    }

    #[test]
    fn test_flags_left_out_keep_config_values() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from(["dprof-operator", "--config", "/etc/dprof.toml", "config"])?;
        assert_eq!(cli.command, Commands::Config);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dprof.toml")));

        let mut base = OperatorConfig::default();
        base.namespace = "team-a".to_string();
        assert_eq!(cli.apply(base.clone()), base);
        Ok(())
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["dprof-operator"]).is_err());
    }
}
