//! Logging settings for the `bkpubsub` daemon.
//!
//! Read from the `[logger]` table of the configuration file and consumed by
//! `LoggerManager`. Console and journald outputs are configured separately;
//! at least one of them has to be enabled.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_has_output"))]
pub struct LoggerConfig {
    /// Default filter when `RUST_LOG` is unset: trace, debug, info, warn or error.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: None,
        }
    }
}

impl LoggerConfig {
    pub fn console_enabled(&self) -> bool {
        self.console.as_ref().is_some_and(|c| c.enabled)
    }

    pub fn journald_enabled(&self) -> bool {
        self.journald.as_ref().is_some_and(|j| j.enabled)
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

fn validate_has_output(config: &LoggerConfig) -> Result<(), ValidationError> {
    if !config.console_enabled() && !config.journald_enabled() {
        let mut err = ValidationError::new("no_log_output");
        err.message = Some("Enable at least one of logger.console or logger.journald".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the module path of each event.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Log span close events with their timings.
    pub show_spans: bool,

    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output. Requires the `journald` feature.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// `SYSLOG_IDENTIFIER` of every journal entry.
    #[validate(length(min = 1, message = "Journald identifier must not be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "bkpubsub".to_string(),
        }
    }
}
