//! Logging setup. Kept as its own module since `main` and the integration
//! tests both need to call it, and it's easy to get double-initialization
//! wrong if it's inlined.

use crate::gateway::config::Settings;

pub fn init_logging(settings: &Settings) {
    let level = settings.log_level();
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env).try_init();
}
