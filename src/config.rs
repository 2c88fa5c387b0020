//! Engine client configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::runtime::{ScriptRuntime, SnapshotTransport};
use crate::models::script_options::{ScriptOptions, DEFAULT_SCRIPT_NAME};
use crate::{AppError, Result};

/// Caller-side deadlines, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for detaching a session.
    #[serde(default = "default_detach_seconds")]
    pub detach_seconds: u64,
    /// Deadline for any other engine call; 0 means no deadline.
    #[serde(default = "default_call_seconds")]
    pub call_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            detach_seconds: default_detach_seconds(),
            call_seconds: default_call_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Detach deadline.
    #[must_use]
    pub fn detach(&self) -> Duration {
        Duration::from_secs(self.detach_seconds)
    }

    /// Per-call deadline, if one is configured.
    #[must_use]
    pub fn call(&self) -> Option<Duration> {
        (self.call_seconds > 0).then(|| Duration::from_secs(self.call_seconds))
    }
}

fn default_detach_seconds() -> u64 {
    10
}

fn default_call_seconds() -> u64 {
    30
}

fn default_script_name() -> String {
    DEFAULT_SCRIPT_NAME.into()
}

/// Configuration parsed from `probe-session.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Engine agent control endpoint, `host:port`.
    pub endpoint: String,
    /// Name given to scripts created without an explicit name.
    #[serde(default = "default_script_name")]
    pub default_script_name: String,
    /// Runtime flavor for new scripts and snapshots.
    #[serde(default)]
    pub default_runtime: ScriptRuntime,
    /// Snapshot delivery mode for new scripts.
    #[serde(default)]
    pub snapshot_transport: SnapshotTransport,
    /// Directory persisting warm-start snapshots; memory-only when absent.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    /// Caller-side deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Script options seeded from this configuration.
    ///
    /// `name` overrides [`default_script_name`](Self::default_script_name).
    #[must_use]
    pub fn script_options(&self, name: Option<&str>) -> ScriptOptions {
        ScriptOptions::new(name.unwrap_or(&self.default_script_name))
            .with_runtime(self.default_runtime)
            .with_snapshot_transport(self.snapshot_transport)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(AppError::Config("endpoint must not be empty".into()));
        }

        if !self.endpoint.contains(':') {
            return Err(AppError::Config(format!(
                "endpoint '{}' must be host:port",
                self.endpoint
            )));
        }

        if self.default_script_name.is_empty() {
            return Err(AppError::Config(
                "default_script_name must not be empty".into(),
            ));
        }

        if self.timeouts.detach_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.detach_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
