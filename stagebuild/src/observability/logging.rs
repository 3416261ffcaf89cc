//! Subscriber setup for `tracing` output.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted for the log filter.
pub const LOG_ENV: &str = "RUST_LOG";

/// Installs a global subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG` when set, else `default_filter`.
/// With `json` set, events are written as JSON lines. Returns false when a
/// global subscriber was already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_ansi(false),
            )
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // Another test may have installed a subscriber first; either way the
        // second attempt in this process must fail.
        let _ = init_tracing("stagebuild=debug", false);
        assert!(!init_tracing("stagebuild=debug", true));
    }
}
