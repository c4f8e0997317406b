//! Engine configuration
//!
//! Built once at startup (YAML file, then environment overrides) and handed to the
//! orchestrator behind an `Arc`. Core algorithms never look configuration up themselves.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ──────────────────────────────────────────────────────────────────────────────
// SECTIONS
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Nodes executed at the same time across independent subtrees
    pub max_concurrency: usize,
    /// Abort with `GraphError::Unreachable` instead of warning
    pub require_full_coverage: bool,
    pub retry: RetryConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            require_full_coverage: false,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Execution log database; the in-memory store is used when unset
    pub sqlite_path: Option<PathBuf>,
    /// Directory for cross-process request lease files
    pub lease_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "privacy_engine=info".to_string(),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// ENGINE CONFIG
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load `.env`, the optional YAML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read configuration file {:?}", path))?;
                Self::from_yaml_str(&raw).with_context(|| format!("Failed to parse configuration file {:?}", path))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside of tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PRIVACY_ENGINE_MAX_CONCURRENCY") {
            self.execution.max_concurrency = parse_var("PRIVACY_ENGINE_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("PRIVACY_ENGINE_REQUIRE_FULL_COVERAGE") {
            self.execution.require_full_coverage = parse_var("PRIVACY_ENGINE_REQUIRE_FULL_COVERAGE", &value)?;
        }
        if let Some(value) = lookup("PRIVACY_ENGINE_RETRY_MAX_ATTEMPTS") {
            self.execution.retry.max_attempts = parse_var("PRIVACY_ENGINE_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("PRIVACY_ENGINE_RETRY_BACKOFF_MS") {
            self.execution.retry.initial_backoff_ms = parse_var("PRIVACY_ENGINE_RETRY_BACKOFF_MS", &value)?;
        }
        if let Some(value) = lookup("PRIVACY_ENGINE_SQLITE_PATH") {
            self.storage.sqlite_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("PRIVACY_ENGINE_LEASE_DIR") {
            self.storage.lease_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("RUST_LOG") {
            self.logging.filter = value;
        }

        if self.execution.max_concurrency == 0 {
            anyhow::bail!("execution.max_concurrency must be at least 1");
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", name, value))
}
