use crate::config::LogLevel;
use crate::error::{Error, Result};
use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber. Safe to call more than once; only the
/// first call takes effect. `REFRACT_LOG` overrides the configured level.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("REFRACT_LOG")
            .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .compact();

        result = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| Error::Config {
                message: format!("Failed to initialize logging: {}", e),
                source: None,
            });
    });

    result
}
