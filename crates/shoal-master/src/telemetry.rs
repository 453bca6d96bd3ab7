//! Logging initialization for the master process.
//!
//! `RUST_LOG` wins when set. Otherwise the configured level applies, with
//! the shoal crates raised to `debug` when the level is `debug` or `trace`.
//! Everything goes to stderr, since worker stdout is the IPC channel and
//! the master's own stdout is left to the operator.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: &str) -> String {
    match level {
        "debug" | "trace" => format!("{level},shoal_master={level},shoal_supervisor={level}"),
        _ => format!("{level},shoal_master=info,shoal_supervisor=info"),
    }
}

/// Install the global subscriber.
pub fn init(level: &str, format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    match format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    tracing::debug!(log_level = level, ?format, "Telemetry initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives("info"),
            "info,shoal_master=info,shoal_supervisor=info"
        );
        assert_eq!(
            default_directives("debug"),
            "debug,shoal_master=debug,shoal_supervisor=debug"
        );
    }

    #[test]
    fn test_directives_parse() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }
}
