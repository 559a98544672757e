//! Configuration for the orchestrator and the kernel it drives.
//!
//! Read as JSON, either from a file or from the `KERNEL_ORCHESTRATOR_CONFIG`
//! environment variable. Every section is optional.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::channel::ExecuteOptions;
use crate::poller::PollConfig;

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV: &str = "KERNEL_ORCHESTRATOR_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Kernel process to launch (optional; the CLI can supply it).
    #[serde(default)]
    pub kernel: Option<KernelConfig>,

    /// Polling configuration (optional).
    #[serde(default)]
    pub poll: Option<PollSection>,

    /// Options sent with every execute request.
    #[serde(default)]
    pub execute: ExecuteOptions,
}

/// How to start the kernel process.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    /// Executable speaking the framed JSON kernel protocol.
    pub exec: String,

    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the kernel process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long to wait for the kernel's Ready frame.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

impl KernelConfig {
    pub fn new(exec: impl Into<String>) -> Self {
        Self {
            exec: exec.into(),
            args: Vec::new(),
            env: HashMap::new(),
            ready_timeout_seconds: default_ready_timeout(),
        }
    }

    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    /// Environment as sorted pairs, for deterministic process setup.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

/// Polling configuration (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct PollSection {
    /// Milliseconds between slot checks.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Ticks before a submission times out.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Milliseconds a drained-mode join waits.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Config {
    /// Load configuration from the `KERNEL_ORCHESTRATOR_CONFIG` environment variable.
    pub fn from_env() -> Result<Self> {
        let json = std::env::var(CONFIG_ENV).with_context(|| format!("{CONFIG_ENV} not set"))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Resolve configuration from the usual sources.
    ///
    /// Priority: explicit file > `KERNEL_ORCHESTRATOR_CONFIG` > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        if std::env::var_os(CONFIG_ENV).is_some() {
            return Self::from_env();
        }
        debug!("No configuration supplied, using defaults");
        Ok(Self::default())
    }

    /// Polling settings: the `poll` section if present, else environment/defaults.
    pub fn poll_config(&self) -> PollConfig {
        self.poll
            .as_ref()
            .map_or_else(PollConfig::from_env, PollConfig::from_section)
    }

    /// Resolve the kernel command.
    ///
    /// Priority: `exec_override` (CLI) > `KERNEL_EXEC` env var > `kernel` section.
    /// Overrides keep the configured args/env unless `args_override` is non-empty.
    pub fn resolved_kernel(
        &self,
        exec_override: Option<&str>,
        args_override: &[String],
    ) -> Result<KernelConfig> {
        let env_exec = std::env::var("KERNEL_EXEC").ok();
        let exec = exec_override.map(str::to_owned).or(env_exec);

        let mut kernel = match (exec, &self.kernel) {
            (Some(exec), Some(configured)) => KernelConfig {
                exec,
                ..configured.clone()
            },
            (Some(exec), None) => KernelConfig::new(exec),
            (None, Some(configured)) => configured.clone(),
            (None, None) => anyhow::bail!(
                "No kernel configured. Pass --kernel, set KERNEL_EXEC, or add a `kernel` section"
            ),
        };

        if !args_override.is_empty() {
            kernel.args = args_override.to_vec();
        }
        Ok(kernel)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

const fn default_ready_timeout() -> u64 {
    30
}

const fn default_interval_ms() -> u64 {
    50
}

const fn default_retry_budget() -> u32 {
    100
}

const fn default_drain_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "kernel": {
                "exec": "/usr/local/bin/py-kernel",
                "args": ["--quiet"],
                "env": {"PYTHONUNBUFFERED": "1"},
                "ready_timeout_seconds": 10
            },
            "poll": {
                "interval_ms": 25,
                "retry_budget": 40
            },
            "execute": {
                "store_history": false
            }
        }"#;

        let config = Config::from_json(json).unwrap();

        let kernel = config.kernel.as_ref().expect("kernel should be set");
        assert_eq!(kernel.exec, "/usr/local/bin/py-kernel");
        assert_eq!(kernel.args, vec!["--quiet"]);
        assert_eq!(kernel.ready_timeout(), Duration::from_secs(10));
        assert_eq!(
            kernel.env_pairs(),
            vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]
        );

        let poll = config.poll_config();
        assert_eq!(poll.interval, Duration::from_millis(25));
        assert_eq!(poll.retry_budget, 40);
        // Default applied for the missing field
        assert_eq!(poll.drain_timeout, Duration::from_secs(5));

        assert!(!config.execute.store_history);
        assert!(config.execute.stop_on_error);
    }

    #[test]
    fn parse_empty_config() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.kernel.is_none());
        assert!(config.poll.is_none());
        assert_eq!(config.execute, ExecuteOptions::default());
    }

    #[test]
    fn kernel_defaults_applied() {
        let config = Config::from_json(r#"{"kernel": {"exec": "kernel"}}"#).unwrap();
        let kernel = config.kernel.unwrap();
        assert!(kernel.args.is_empty());
        assert_eq!(kernel.ready_timeout_seconds, 30);
    }

    #[test]
    fn cli_override_keeps_configured_env() {
        let config = Config::from_json(
            r#"{"kernel": {"exec": "/configured", "env": {"A": "1"}, "args": ["-x"]}}"#,
        )
        .unwrap();

        let kernel = config.resolved_kernel(Some("/cli"), &[]).unwrap();
        assert_eq!(kernel.exec, "/cli");
        assert_eq!(kernel.args, vec!["-x"]);
        assert_eq!(kernel.env["A"], "1");

        let kernel = config
            .resolved_kernel(Some("/cli"), &["-y".to_string()])
            .unwrap();
        assert_eq!(kernel.args, vec!["-y"]);
    }

    #[test]
    fn resolved_kernel_from_cli_without_config() {
        let config = Config::default();
        let kernel = config.resolved_kernel(Some("/cli"), &[]).unwrap();
        assert_eq!(kernel.exec, "/cli");
        assert_eq!(kernel.ready_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.json");
        std::fs::write(&path, r#"{"poll": {"retry_budget": 20}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let poll = config.poll_config();
        assert_eq!(poll.retry_budget, 20);
        assert_eq!(poll.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn load_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
