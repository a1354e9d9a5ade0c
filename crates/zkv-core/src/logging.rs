//! Tracing subscriber setup shared by embedding applications and tests.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ZkvError, ZkvResult};

/// Install a global subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns an error if another global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> ZkvResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "text" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init(),
        other => {
            return Err(ZkvError::Config(format!(
                "logging.format must be \"json\" or \"text\", got {other:?}"
            )))
        }
    };

    result.map_err(|e| ZkvError::Config(format!("installing tracing subscriber: {e}")))
}
