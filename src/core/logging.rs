//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. the level passed by the host
//! 2. `PLANFLOW_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! The library itself only emits events; installing a subscriber is left to
//! the host binary.

use tracing::Level;

pub const LOG_ENV_VAR: &str = "PLANFLOW_LOG";

/// Installs a global fmt subscriber. Returns `false` when one was already set.
pub fn init_tracing(level: Option<Level>) -> bool {
    let level = level
        .or_else(|| {
            std::env::var(LOG_ENV_VAR)
                .ok()
                .and_then(|s| parse_level(&s))
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok()
}

pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_level(" Debug "), Some(Level::DEBUG));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }
}
