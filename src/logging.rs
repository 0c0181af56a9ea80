use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Install the global tracing subscriber. The `RUST_LOG` environment
/// variable, when set, wins over the configured level.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("meshssh={level},russh=warn")));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .init();
        }
    }
}
