use tracing_subscriber::{EnvFilter, fmt};

/// Environment flag that enables guest `log` output.
pub const GUEST_LOGGING_ENV: &str = "WASM_ENABLE_LOGGING";
/// Environment variable holding the tracing filter directives.
pub const LOG_FILTER_ENV: &str = "ASYNCIFY_LOG";

/// Parse a loose boolean: `true|yes|1` and `false|no|0`, case-insensitive.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

pub fn guest_logging_enabled() -> bool {
    std::env::var(GUEST_LOGGING_ENV)
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(false)
}

/// Install the stderr fmt subscriber. Safe to call more than once; only the
/// first call installs anything.
pub fn init_tracing() {
    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) if guest_logging_enabled() => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("info"),
    };
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
