//! Thin facade over the logging stack so the rest of the workspace only ever
//! imports this module.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::Config;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build the default terminal logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// Build a logger from a TOML configuration snippet understood by `sloggers`.
pub fn from_toml(config: &str) -> Logger {
    let config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(config).expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without one.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child or a discard logger.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
