//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` takes precedence; without it the filter
//! defaults to the configured level for this crate and for `tower_http`.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingSettings;
use crate::core::error::{GatewayError, GatewayResult};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" | "compact" => Ok(Self::Text),
            other => Err(GatewayError::config(format!("unknown log format '{}'", other))),
        }
    }
}

fn parse_level(raw: &str) -> GatewayResult<Level> {
    raw.parse::<Level>()
        .map_err(|_| GatewayError::config(format!("unknown log level '{}'", raw)))
}

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(level: Level) -> String {
    let level = level.to_string().to_ascii_lowercase();
    format!("api_dataplane={},tower_http={}", level, level)
}

/// Install the global subscriber
///
/// Installing twice is not an error; the second call logs a warning and keeps the first subscriber.
pub fn init_logging(settings: &LoggingSettings) -> GatewayResult<()> {
    let level = parse_level(&settings.level)?;
    let format = LogFormat::parse(&settings.format)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let installed = match format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().compact().with_target(true))
            .try_init(),
    };

    if installed.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %level, format = ?format, "Structured logging initialized");
    Ok(())
}
