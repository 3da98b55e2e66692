use std::env;
use std::sync::OnceLock;

static WEBNNRS_BACKEND: OnceLock<String> = OnceLock::new();
static WEBNNRS_MIN_BUFFER_BYTES: OnceLock<u64> = OnceLock::new();
static WEBNNRS_DUMP_NATIVE_GRAPH: OnceLock<bool> = OnceLock::new();

pub(crate) const DEFAULT_BACKEND: &str = "cpu";
pub(crate) const DEFAULT_MIN_BUFFER_BYTES: u64 = 256;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Backend name used by `Context::from_env`.
pub(crate) fn default_backend() -> &'static str {
    WEBNNRS_BACKEND.get_or_init(|| match env::var("WEBNNRS_BACKEND") {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => DEFAULT_BACKEND.to_string(),
    })
}

/// Smallest allocation made by the resource pool.
pub(crate) fn min_buffer_bytes() -> u64 {
    *WEBNNRS_MIN_BUFFER_BYTES.get_or_init(|| match env::var("WEBNNRS_MIN_BUFFER_BYTES") {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .unwrap_or(DEFAULT_MIN_BUFFER_BYTES),
        Err(_) => DEFAULT_MIN_BUFFER_BYTES,
    })
}

pub(crate) fn dump_native_graph() -> bool {
    *WEBNNRS_DUMP_NATIVE_GRAPH.get_or_init(|| match env::var("WEBNNRS_DUMP_NATIVE_GRAPH") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
