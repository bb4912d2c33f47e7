//! Tracing subscriber setup for the `distpatch` binary and embedding callers.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable lines on stderr.
    Human,
    /// One JSON object per event, for log shipping.
    Json,
}

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// `filter` follows `EnvFilter` syntax; when `None`, `RUST_LOG` is consulted
/// and falls back to `distpatch=info`.
pub fn init(profile: Profile, filter: Option<&str>) {
    INIT.call_once(|| {
        let filter = match filter {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("distpatch=info")),
        };
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        let result = match profile {
            Profile::Human => builder.try_init(),
            Profile::Json => builder.json().try_init(),
        };
        if let Err(e) = result {
            eprintln!("logging already initialised: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        init(Profile::Human, Some("distpatch=debug"));
        init(Profile::Json, None);
    }
}
