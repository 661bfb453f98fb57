//! Subscriber setup for binaries embedding the upload stack.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the application. `init_tracing` is a convenience for the common case.

#[cfg(feature = "tracing-basic")]
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "dog_upload=info,dog_process=info";

/// Install a global `fmt` subscriber honouring `RUST_LOG`.
/// Calling it again after a subscriber is set is a no-op.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
