//! Structured logging.
//!
//! Every event can be mirrored to a per-instance JSONL file next to the
//! usual console output:
//!
//! ```text
//! <log_dir>/raw/2026-10-19_laptop.jsonl
//! ```
//!
//! ```ignore
//! masq_core::logging::init_logging(1, Some(Path::new("./logs")), "laptop")?;
//! ```
//!
//! Query with jq, e.g. `jq 'select(.fields.channel == "abc")' logs/raw/*.jsonl`.

mod layer;
mod writer;

pub use layer::JsonlLayer;
pub use writer::{read_entries, InstanceLogWriter, JsonLogEntry};

use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count
pub fn filter_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the verbosity-derived filter. With `log_dir` set,
/// events are also written to `<log_dir>/raw/<date>_<instance>.jsonl`.
pub fn init_logging(
    verbosity: u8,
    log_dir: Option<&Path>,
    instance: &str,
) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbosity)));

    let jsonl = match log_dir {
        Some(dir) => Some(JsonlLayer::new(dir, instance)?),
        None => None,
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .try_init();

    if result.is_err() {
        // A subscriber is already installed (tests, embedding apps)
        tracing::debug!("Global subscriber already set");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(filter_for_verbosity(0), "warn");
        assert_eq!(filter_for_verbosity(1), "info");
        assert_eq!(filter_for_verbosity(2), "debug");
        assert_eq!(filter_for_verbosity(9), "trace");
    }
}
