//! Error types for plumbkit-core
//!
//! The coordination components themselves are infallible; these errors cover
//! the ambient surfaces around them (configuration loading, logging setup,
//! origin parsing).

use std::fmt::Write;
use thiserror::Error;

use crate::logging::LogError;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for plumbkit-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialisation errors
    #[error("Logging error: {0}")]
    Log(#[from] LogError),

    /// A string that does not name a usable origin
    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Log(LogError::AlreadyInitialized) => None,
            Self::Log(_) => Some(
                Remediation::new("Check the [logging] section and the log file path.")
                    .alternative("Unset RUST_LOG if it holds an invalid filter."),
            ),
            Self::InvalidOrigin(_) => Some(
                Remediation::new("Pass an absolute URL such as https://example.com.")
                    .alternative("Opaque origins (data:, about:) cannot be registered."),
            ),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check that it exists and is readable."
            )),
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Delete unknown sections; every key has a default."),
            Self::InvalidValue { key, .. } => {
                Remediation::new(format!("Set {key} to a whole number of seconds."))
            }
        }
    }
}
