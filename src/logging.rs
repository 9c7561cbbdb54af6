//! Logging setup for the binary, on `tracing` and `tracing-subscriber`.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from the `-v` count.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,sav2xlsx=info",
        1 => "debug",
        _ => "trace",
    }
}

pub fn init_logging(verbosity: u8) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
}
