use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber.
///
/// Consumer hosts and the `fairq` repair CLI call this once at startup so
/// claim, reclaim, and forced-repair events reach an actual sink. Debug
/// builds write human-readable lines; release builds write JSON for log
/// shipping. The level comes from `RUST_LOG`, defaulting to `info`.
///
/// Installing a second subscriber is a no-op, so embedding applications
/// that already set one up keep theirs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg!(debug_assertions) {
        let _ = builder.with_target(true).try_init();
    } else {
        let _ = builder.json().try_init();
    }
}
