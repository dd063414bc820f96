//! Logger initialisation shared by the daemon and tooling binaries.

use env_logger::Env;

/// Initialise the global logger with `default_level` unless `RUST_LOG` is
/// set. Safe to call more than once; later calls are no-ops.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_secs()
        .try_init();
}
