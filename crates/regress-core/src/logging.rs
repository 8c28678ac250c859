//! Log output setup for binaries and tests embedding the engine.

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` when `verbose`
/// and `info` when not. Returns false if a global subscriber already exists.
pub fn init(verbose: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .try_init()
        .is_ok()
}

fn filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init(true);
        assert!(!init(false));
    }
}
