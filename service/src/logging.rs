//! Terminal logging for the relay.

use crate::config::Config;
use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Dependencies silenced below `TRACE`: the database driver, the upstream
/// websocket stack and the callback HTTP client.
const QUIET_DEPENDENCIES: &[&str] = &[
    "sqlx",
    "sea_orm",
    "tungstenite",
    "tokio_tungstenite",
    "native_tls",
    "hyper",
    "hyper_util",
    "reqwest",
    "rustls",
];

pub struct Logger;

impl Logger {
    /// Installs the global terminal logger at the configured level.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let level = config.log_level_filter;
        TermLogger::init(
            level,
            Self::log_config(level),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )
    }

    fn log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        for module in Self::silenced_modules(level) {
            builder.add_filter_ignore_str(module);
        }
        builder.build()
    }

    /// `TRACE` shows everything, dependency chatter included.
    fn silenced_modules(level: LevelFilter) -> &'static [&'static str] {
        match level {
            LevelFilter::Trace => &[],
            _ => QUIET_DEPENDENCIES,
        }
    }
}
