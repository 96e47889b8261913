//! Tracing bootstrap for the console.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,chat_console=debug,chat_client=debug";
const FILTER_VARS: [&str; 2] = ["NOTECHAT_CONSOLE_LOG", "NOTECHAT_LOG"];

/// Install the global fmt subscriber.
///
/// The filter comes from `RUST_LOG`, then `NOTECHAT_CONSOLE_LOG`, then
/// `NOTECHAT_LOG`, then the built-in default. Output goes to stderr so it
/// does not interleave with typed input echo.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in FILTER_VARS {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
