use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{GuardError, GuardResult};

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured
/// level. Critical alerts are emitted on the `security_alert` target, so they
/// can be routed separately with a filter such as `security_alert=error`.
pub fn init_tracing(config: &LoggingConfig) -> GuardResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| GuardError::config(format!("failed to initialise tracing: {}", e)))?;

    tracing::debug!(level = %config.level, format = ?config.format, "Tracing initialized");
    Ok(())
}
