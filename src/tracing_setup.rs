//! Subscriber installation and the spans shared by the request path.
use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::{LogFormat, LoggingConfig};

fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}")),
    }
}

/// Install the subscriber described by the `[logging]` section.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_from_config(logging: &LoggingConfig) -> Result<()> {
    let filter = env_filter(&logging.level)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let installed = match logging.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(logging.spans)
                    .with_span_list(logging.spans),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(
        level = %logging.level,
        format = ?logging.format,
        spans = logging.spans,
        "Logging initialized"
    );
    Ok(())
}

/// Span covering one inbound exchange, from admission to response.
pub fn create_request_span(method: &str, path: &str, pipeline: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "exchange",
        http.method = method,
        http.path = path,
        pipeline = pipeline,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span around one forward to an upstream host.
pub fn create_backend_span(upstream: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "upstream",
        upstream = upstream,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}
