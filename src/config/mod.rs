//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. Everything is
//! optional; unset variables fall back to defaults.

use crate::error::{Error, Result};
use crate::instrument::{InstrumentationSettings, Operation};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default idle timeout for streaming spans, in seconds.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 300;

/// Upper bound for the stream idle timeout (30 days).
pub const MAX_STREAM_IDLE_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub service_name: String,
    pub log_level: String,
    pub instrumentation: InstrumentationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            otel_endpoint: None,
            service_name: "langspan".to_string(),
            log_level: "info".to_string(),
            instrumentation: InstrumentationSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let capture_content = match optional_var("LANGSPAN_CAPTURE_CONTENT") {
            Some(raw) => parse_bool("LANGSPAN_CAPTURE_CONTENT", &raw)?,
            None => defaults.instrumentation.capture_content,
        };

        let idle_secs = match optional_var("LANGSPAN_STREAM_IDLE_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                Error::Config(format!(
                    "LANGSPAN_STREAM_IDLE_TIMEOUT_SECS must be a number of seconds: {e}"
                ))
            })?,
            None => DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
        };

        let disabled_operations = match optional_var("LANGSPAN_DISABLED_OPERATIONS") {
            Some(raw) => parse_operations(raw.split(','))?,
            None => Vec::new(),
        };

        Ok(Self {
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            service_name: optional_var("LANGSPAN_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
            instrumentation: InstrumentationSettings {
                capture_content,
                stream_idle_timeout: idle_timeout(idle_secs)?,
                disabled_operations,
            },
        })
    }

    /// Load configuration from a TOML file.
    ///
    /// ```toml
    /// service_name = "my-agent"
    /// otel_endpoint = "http://localhost:4317"
    ///
    /// [instrumentation]
    /// capture_content = false
    /// stream_idle_timeout_secs = 60
    /// disabled_operations = ["images.generate"]
    /// ```
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("bad config {}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Self::default();
        let section = file.instrumentation.unwrap_or_default();

        Ok(Self {
            otel_endpoint: file.otel_endpoint,
            service_name: file.service_name.unwrap_or(defaults.service_name),
            log_level: file.log_level.unwrap_or(defaults.log_level),
            instrumentation: InstrumentationSettings {
                capture_content: section
                    .capture_content
                    .unwrap_or(defaults.instrumentation.capture_content),
                stream_idle_timeout: idle_timeout(
                    section
                        .stream_idle_timeout_secs
                        .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
                )?,
                disabled_operations: parse_operations(
                    section.disabled_operations.iter().map(String::as_str),
                )?,
            },
        })
    }
}

/// On-disk shape of the TOML config.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    otel_endpoint: Option<String>,
    service_name: Option<String>,
    log_level: Option<String>,
    instrumentation: Option<InstrumentationSection>,
}

#[derive(Debug, Default, Deserialize)]
struct InstrumentationSection {
    capture_content: Option<bool>,
    stream_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    disabled_operations: Vec<String>,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{name} must be a boolean, got {other:?}"))),
    }
}

fn parse_operations<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<Operation>> {
    names
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            name.parse::<Operation>()
                .map_err(|_| Error::Config(format!("unknown operation {name:?}")))
        })
        .collect()
}

// Zero disables the watchdog.
fn idle_timeout(secs: u64) -> Result<Option<Duration>> {
    if secs > MAX_STREAM_IDLE_TIMEOUT_SECS {
        return Err(Error::Config(format!(
            "stream idle timeout of {secs}s exceeds the {MAX_STREAM_IDLE_TIMEOUT_SECS}s maximum"
        )));
    }
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
