//! Logging bootstrap
//!
//! All subsystems log through `tracing`; the module path is the target
//! (`amirun::memory`, `amirun::trap`, `amirun::machine`, `amirun::schedule`).

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "amirun=info";

/// Install a formatting subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Returns false if a global
/// subscriber was already installed, which is harmless.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Subscriber for tests: captured output, everything down to trace level
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("amirun=trace"))
        .with_test_writer()
        .try_init();
}
