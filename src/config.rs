//! Runtime configuration for the orchestrator.
//!
//! Settings are layered: built-in defaults, then an optional
//! `conductor.toml` in the working directory, then `CONDUCTOR_*`
//! environment variables. Nested keys use `__` in the environment
//! (e.g. `CONDUCTOR_TIMEOUTS__UNIT_TIMEOUT_SECS=120`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Hard upper bound on concurrent workers, regardless of configuration.
/// Bounds resource contention on the shared working tree.
pub const CONCURRENCY_HARD_CAP: usize = 5;

/// Timeout settings for orchestration operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Maximum wall-clock time for a single unit's worker invocation.
    /// Default: 900 seconds (15 minutes).
    pub unit_timeout_secs: u64,

    /// Maximum wall-clock time for an entire batch. Default: 3600
    /// seconds (1 hour).
    pub batch_timeout_secs: u64,

    /// Maximum time for a single environment probe query. Default: 30
    /// seconds.
    pub probe_timeout_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            unit_timeout_secs: 900,
            batch_timeout_secs: 3600,
            probe_timeout_secs: 30,
        }
    }
}

impl TimeoutSettings {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Sets the per-unit timeout.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the whole-batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_secs = timeout.as_secs();
        self
    }
}

/// Repository coordinates for the environment probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSettings {
    /// GitHub owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Base branch that unit branches fork from. Default: `main`.
    pub base_branch: String,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding persisted run state. Default: `.conductor/state`.
    pub state_dir: PathBuf,

    /// Target batch size for the planner. Valid range 1..=16, default 4.
    pub batch_size: usize,

    /// Maximum concurrent workers per batch. Defaults to the batch
    /// size; always clamped to [`CONCURRENCY_HARD_CAP`].
    pub max_concurrency: usize,

    /// Retry bound for transient worker failures before escalation.
    /// Default: 2.
    pub retry_limit: u32,

    /// Timeout settings.
    pub timeouts: TimeoutSettings,

    /// Repository coordinates for the probe.
    pub repo: RepoSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".conductor/state"),
            batch_size: 4,
            max_concurrency: 4,
            retry_limit: 2,
            timeouts: TimeoutSettings::default(),
            repo: RepoSettings {
                owner: String::new(),
                repo: String::new(),
                base_branch: "main".to_string(),
            },
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from defaults, `conductor.toml` (if present),
    /// and `CONDUCTOR_*` environment variables.
    pub fn load() -> OrchestratorResult<Self> {
        Self::load_from(PathBuf::from("conductor"))
    }

    /// Load configuration with an explicit config file stem.
    pub fn load_from(file_stem: PathBuf) -> OrchestratorResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("CONDUCTOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let loaded: Self = builder
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        loaded.validated()
    }

    /// Validate ranges and apply the concurrency hard cap.
    pub fn validated(mut self) -> OrchestratorResult<Self> {
        if self.batch_size == 0 {
            return Err(OrchestratorError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size > 16 {
            return Err(OrchestratorError::Config(format!(
                "batch_size {} exceeds the supported maximum of 16",
                self.batch_size
            )));
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = self.batch_size;
        }
        self.max_concurrency = self.max_concurrency.min(CONCURRENCY_HARD_CAP);
        Ok(self)
    }

    /// Effective concurrency for a batch of the given size.
    pub fn effective_concurrency(&self, batch_len: usize) -> usize {
        self.max_concurrency
            .min(batch_len.max(1))
            .min(CONCURRENCY_HARD_CAP)
    }

    /// Sets the batch size bound.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the concurrency limit (clamped on validation).
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Sets the transient retry bound.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Sets the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Sets the timeout settings.
    pub fn with_timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.repo.base_branch, "main");
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = TimeoutSettings::default();
        assert_eq!(timeouts.unit_timeout(), Duration::from_secs(900));
        assert_eq!(timeouts.batch_timeout(), Duration::from_secs(3600));
        assert_eq!(timeouts.probe_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_builder_pattern() {
        let config = OrchestratorConfig::default()
            .with_batch_size(5)
            .with_max_concurrency(3)
            .with_retry_limit(1)
            .with_timeouts(
                TimeoutSettings::default().with_unit_timeout(Duration::from_secs(120)),
            );

        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.retry_limit, 1);
        assert_eq!(config.timeouts.unit_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_env_var_overrides_state_dir() {
        std::env::set_var("CONDUCTOR_STATE_DIR", "/tmp/conductor-env-state");
        let config = OrchestratorConfig::load_from(PathBuf::from("no-such-config"))
            .expect("load");
        std::env::remove_var("CONDUCTOR_STATE_DIR");
        assert_eq!(config.state_dir, PathBuf::from("/tmp/conductor-env-state"));
    }

    #[test]
    fn test_nested_env_var_overrides_timeout() {
        std::env::set_var("CONDUCTOR_TIMEOUTS__UNIT_TIMEOUT_SECS", "120");
        let config = OrchestratorConfig::load_from(PathBuf::from("no-such-config"))
            .expect("load");
        std::env::remove_var("CONDUCTOR_TIMEOUTS__UNIT_TIMEOUT_SECS");
        assert_eq!(config.timeouts.unit_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let result = OrchestratorConfig::default().with_batch_size(0).validated();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_applies_hard_cap() {
        let config = OrchestratorConfig::default()
            .with_max_concurrency(12)
            .validated()
            .expect("valid config");
        assert_eq!(config.max_concurrency, CONCURRENCY_HARD_CAP);
    }

    #[test]
    fn test_validation_defaults_concurrency_to_batch_size() {
        let config = OrchestratorConfig::default()
            .with_batch_size(3)
            .with_max_concurrency(0)
            .validated()
            .expect("valid config");
        assert_eq!(config.max_concurrency, 3);
    }

    #[test]
    fn test_effective_concurrency_bounded_by_batch_len() {
        let config = OrchestratorConfig::default().with_max_concurrency(5);
        assert_eq!(config.effective_concurrency(2), 2);
        assert_eq!(config.effective_concurrency(8), 5);
        assert_eq!(config.effective_concurrency(0), 1);
    }
}
