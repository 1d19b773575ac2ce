//! Logging setup and fatal-path macros
//!
//! All diagnostics go through the `log` facade to stderr via env_logger.
//! The threshold comes from `LOGGER_LEVEL`, which accepts either a level name
//! or the numeric scale 0-5 used by older deployments.

use log::LevelFilter;

/// Environment variable holding the log threshold
pub const LOGGER_LEVEL_ENV: &str = "LOGGER_LEVEL";

/// Threshold used when `LOGGER_LEVEL` is unset or unparsable
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Warn;

/// Parse a `LOGGER_LEVEL` value into a level filter
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let value = value.trim();
    if let Ok(n) = value.parse::<u32>() {
        return Some(match n {
            0 | 1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        });
    }
    value.parse::<LevelFilter>().ok()
}

/// Level configured in the environment, or the default
pub fn level_from_env() -> LevelFilter {
    std::env::var(LOGGER_LEVEL_ENV)
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(DEFAULT_LEVEL)
}

/// Install the stderr logger
///
/// Uses `try_init` so that a host application which already installed a
/// logger keeps it; in that case our records go to its logger instead.
pub fn init(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .try_init();
    log::set_max_level(level);
}

/// Log an error and terminate the process with a non-zero status
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        ::std::process::exit(1)
    }};
}

/// Abort when an internal invariant does not hold
///
/// Used where continuing would mean calling through a null foreign
/// function pointer.
#[macro_export]
macro_rules! bug_on {
    ($cond:expr) => {
        if $cond {
            ::log::error!(
                "BUG: failure at {}:{}/{}()!",
                file!(),
                line!(),
                module_path!()
            );
            ::std::process::abort();
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_levels() {
        assert_eq!(parse_level("0"), Some(LevelFilter::Error));
        assert_eq!(parse_level("2"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("3"), Some(LevelFilter::Info));
        assert_eq!(parse_level("4"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("5"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("42"), Some(LevelFilter::Trace));
    }

    #[test]
    fn test_parse_named_levels() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_bug_on_false_is_noop() {
        bug_on!(1 + 1 == 3);
    }
}
