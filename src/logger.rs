//! Global `tracing` subscriber setup.
//!
//! `LoggerManager` turns a validated `LoggerConfig` into a registry with a
//! console layer and, when built with the `journald` feature, a systemd
//! journal layer. `RUST_LOG` takes precedence over the configured level.

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

#[cfg(feature = "journald")]
use crate::print_info;
use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig},
    print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// Opening the journald socket failed.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald was requested as the only output and could not be opened.
    #[error("Journald is the only enabled log output and failed to initialize")]
    JournaldUnavailable,

    #[error("Failed to install global subscriber: {0}")]
    InstallError(String),
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Call once, before the first event.
    ///
    /// A journald failure is only fatal when the console is disabled.
    pub fn init(&self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(Self::console_layer(console, self.filter()));
        }

        if self.config.journald_enabled() {
            match self.journald_layer() {
                Ok(layer) => layers.push(layer),
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if !self.config.console_enabled() {
                        return Err(LoggerError::JournaldUnavailable);
                    }
                }
            }
        }

        if layers.is_empty() {
            return Err(LoggerError::NoLayersConfigured);
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InstallError(e.to_string()))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        }
    }

    #[cfg(feature = "journald")]
    fn journald_layer(&self) -> Result<BoxedLayer, LoggerError> {
        let identifier = self
            .config
            .journald
            .as_ref()
            .map(|j| j.identifier.clone())
            .unwrap_or_default();
        let layer = tracing_journald::layer()?.with_syslog_identifier(identifier.clone());
        print_info!(
            "Systemd journald logger initialized with identifier: {}",
            identifier
        );
        Ok(layer.with_filter(self.filter()).boxed())
    }

    #[cfg(not(feature = "journald"))]
    fn journald_layer(&self) -> Result<BoxedLayer, LoggerError> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "built without the journald feature",
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_console_layer_formats() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let config = ConsoleConfig {
                format,
                ..Default::default()
            };
            // building must not touch global state
            let _layer = LoggerManager::console_layer(&config, EnvFilter::new("info"));
        }
    }
}
