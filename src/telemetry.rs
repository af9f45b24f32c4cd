//! Shared logging configuration and initialization.
//!
//! Builds the subscriber stack: the fmt layer for operator-facing output
//! (filtered by `LOGSHIP_LOG_FILTER`) plus the console capture layer, which
//! sees events unfiltered and applies the pipeline's own level gate.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::collector::Collector;
use crate::config::{env_flag, env_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub filter: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("telemetry already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Defaults overlaid with the `LOGSHIP_LOG_*` environment variables;
/// unrecognized values keep the default, like the collector's own
/// [`CollectorConfig::from_env`](crate::config::CollectorConfig::from_env).
pub fn telemetry_config_from_env() -> TelemetryConfig {
    let defaults = TelemetryConfig::default();
    TelemetryConfig {
        filter: env_string("LOGSHIP_LOG_FILTER").unwrap_or(defaults.filter),
        format: env_string("LOGSHIP_LOG_FORMAT")
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or(defaults.format),
        include_target: env_flag("LOGSHIP_LOG_TARGET").unwrap_or(defaults.include_target),
    }
}

/// Installs the global subscriber: fmt output plus console capture routed
/// into the collector.
pub fn init_telemetry(
    config: &TelemetryConfig,
    collector: &Collector,
) -> Result<(), TelemetryInitError> {
    let env_filter =
        EnvFilter::try_new(config.filter.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let capture = collector.console_layer();

    match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(config.include_target)
                .with_filter(env_filter);
            let subscriber = tracing_subscriber::registry().with(capture).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(config.include_target)
                .with_filter(env_filter);
            let subscriber = tracing_subscriber::registry().with(capture).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_env::ScopedEnv;

    #[test]
    fn log_format_parses_known_names_only() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" PRETTY "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("yaml"), None);
        assert_eq!(LogFormat::parse(""), None);
    }

    #[test]
    fn env_overlay_reads_filter_format_and_target() {
        let _env = ScopedEnv::new()
            .set("LOGSHIP_LOG_FILTER", "debug,hyper=warn")
            .set("LOGSHIP_LOG_FORMAT", "json")
            .set("LOGSHIP_LOG_TARGET", "off");

        let cfg = telemetry_config_from_env();
        assert_eq!(cfg.filter, "debug,hyper=warn");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unset_or_unparsable_env_keeps_defaults() {
        let _env = ScopedEnv::new()
            .unset("LOGSHIP_LOG_FILTER")
            .set("LOGSHIP_LOG_FORMAT", "yaml")
            .set("LOGSHIP_LOG_TARGET", "maybe");

        assert_eq!(telemetry_config_from_env(), TelemetryConfig::default());
    }
}
