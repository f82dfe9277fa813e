//! Subscriber setup for the `tracing` events emitted by the engine.
//!
//! `RUST_LOG` wins when set; otherwise `default_directive` is used
//! (e.g. `"lattice_in_parallel=debug"`). Installing twice is harmless: the
//! second call reports `false` and leaves the first subscriber in place.

use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

pub fn init_tracing(default_directive: &str) -> bool {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(default_directive),
    };

    tracing_fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .try_init()
        .is_ok()
}
