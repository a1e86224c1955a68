pub mod config;
pub mod crawl;
pub mod daemon;
pub mod error;
pub mod models;
pub mod provider;
pub mod scheduler;
pub mod store;

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support;

use env_logger::Env;
use std::sync::Once;

pub use daemon::{Daemon, DaemonConfig};
pub use error::Error;

static LOGGER: Once = Once::new();

/// Install the `env_logger` backend once; later calls are no-ops.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}
