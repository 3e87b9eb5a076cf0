use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub fn default_level(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Initialize logging. `RUST_LOG` wins over `default_level`; JSON output is meant
/// for cluster deployments, the pretty format for local runs.
pub fn init_tracing(default_level: &str, json_format: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .wrap_err_with(|| format!("Invalid log level: {default_level}"))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let result = if json_format {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    result.wrap_err("a global tracing subscriber is already installed")?;

    tracing::info!(json = json_format, level = default_level, "fnagent logging initialized");
    Ok(())
}

/// Span covering one inbound function invocation.
pub fn create_invocation_span(function: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "invocation",
        function = function,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}

/// Span covering one forwarding attempt to a backend.
pub fn create_forward_span(function: &str, target: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "forward",
        function = function,
        backend.url = target,
        attempt = attempt,
    )
}
