// src/logging.rs
//
// tracing subscriber setup for the binary.
//
// Filter precedence: ARCADE_REPLAY_LOG, then RUST_LOG, then a level picked
// from the -v count (0 = warn, 1 = info, 2 = debug, 3+ = trace). Logs go to
// stderr so stdout stays free for command output.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "ARCADE_REPLAY_LOG";

/// Default directive for a `-v` count.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn build_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(verbosity))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
