//! Configuration for plumbkit (plumbkit.toml).
//!
//! Every section and key has a default, so an empty file is a valid config.
//! The dispatcher interval can also be overridden from the environment with
//! `PLUMBKIT_QUOTA_CHANGE_INTERVAL` (whole seconds), which wins over the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::incident_log::DEFAULT_INCIDENT_CAPACITY;
use crate::logging::LogConfig;

/// Environment variable overriding `dispatcher.event_interval_secs`.
pub const QUOTA_CHANGE_INTERVAL_ENV: &str = "PLUMBKIT_QUOTA_CHANGE_INTERVAL";

/// Default debounce window for quota change events.
pub const DEFAULT_QUOTA_CHANGE_INTERVAL_SECS: u64 = 60;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// `[incident_log]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentLogConfig {
    /// Maximum incidents retained per root scope. Zero disables retention.
    pub capacity: usize,
}

impl Default for IncidentLogConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_INCIDENT_CAPACITY,
        }
    }
}

/// `[dispatcher]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Minimum spacing between two global dispatches, in seconds.
    pub event_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_interval_secs: DEFAULT_QUOTA_CHANGE_INTERVAL_SECS,
        }
    }
}

impl DispatcherConfig {
    /// The debounce window as a `Duration`.
    #[must_use]
    pub fn event_interval(&self) -> Duration {
        Duration::from_secs(self.event_interval_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlumbingConfig {
    pub incident_log: IncidentLogConfig,
    pub dispatcher: DispatcherConfig,
    pub logging: LogConfig,
}

impl PlumbingConfig {
    /// Parse a config from TOML text. Environment overrides are not applied.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Ok(config)
    }

    /// Read and parse `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            capacity = config.incident_log.capacity,
            event_interval_secs = config.dispatcher.event_interval_secs,
            "Loaded plumbing config"
        );
        Ok(config)
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<()> {
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                value: self.logging.level.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let value = std::env::var(QUOTA_CHANGE_INTERVAL_ENV).ok();
        self.apply_interval_override(value.as_deref())
    }

    fn apply_interval_override(&mut self, value: Option<&str>) -> Result<()> {
        let Some(raw) = value else {
            return Ok(());
        };
        let secs = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue {
                key: QUOTA_CHANGE_INTERVAL_ENV.to_string(),
                value: raw.to_string(),
            })?;
        self.dispatcher.event_interval_secs = secs;
        Ok(())
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }
}

// =============================================================================
// Configuration service
// =============================================================================

/// Source of the dispatcher's debounce interval.
///
/// The dispatcher asks once, on first use, and caches the answer.
pub trait IntervalSource {
    fn dispatch_interval(&self) -> Duration;
}

impl IntervalSource for DispatcherConfig {
    fn dispatch_interval(&self) -> Duration {
        self.event_interval()
    }
}

impl IntervalSource for PlumbingConfig {
    fn dispatch_interval(&self) -> Duration {
        self.dispatcher.event_interval()
    }
}

impl IntervalSource for Duration {
    fn dispatch_interval(&self) -> Duration {
        *self
    }
}
