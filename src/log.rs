//! Leveled-logging facade.
//!
//! The core never relies on log output for correctness; this just bridges the seven severity
//! levels used throughout the design notes onto the five the `log` crate understands.

/// Severity of a log record emitted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl Level {
    fn as_log_level(self) -> log::Level {
        match self {
            Level::Fatal | Level::Error => log::Level::Error,
            Level::Warning => log::Level::Warn,
            Level::Info => log::Level::Info,
            Level::Verbose | Level::Debug => log::Level::Debug,
            Level::Trace => log::Level::Trace,
        }
    }
}

/// Emits a log record at the given level, tagged with `target`.
pub fn log(level: Level, target: &str, message: std::fmt::Arguments<'_>) {
    log::log!(target: "weave", level.as_log_level(), "[{}] {}", target, message);
}

macro_rules! weave_log {
    ($level:expr, $target:expr, $($arg:tt)+) => {
        $crate::log::log($level, $target, format_args!($($arg)+))
    };
}

pub(crate) use weave_log;
