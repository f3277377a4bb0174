//! Console logging for the binaries.
//!
//! The library logs through the `log` facade; the subscriber's `tracing-log`
//! bridge picks those records up. `RUST_LOG` overrides the default filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "warn,lot_tracker=info,rebuild_wallets=info";

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    // A second init (tests, embedding) keeps the first subscriber
    if tracing_subscriber::registry().with(filter).with(console).try_init().is_err() {
        log::debug!("Logging already initialised");
    }
}
