//! Utilities for logging.
use std::fmt;
use std::str::FromStr;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::SubscriberBuilder;

/// How verbose the default log directive should be.
///
/// `RUST_LOG` always takes precedence when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<u8> for Verbosity {
    fn from(value: u8) -> Self {
        match value {
            0 => Verbosity::Info,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl From<Verbosity> for LevelFilter {
    fn from(value: Verbosity) -> Self {
        match value {
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    HumanReadable,
    Compact,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogFormat::Json => "json",
            LogFormat::HumanReadable => "human_readable",
            LogFormat::Compact => "compact",
        };
        write!(f, "{s}")
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "json" => LogFormat::Json,
            "human_readable" | "human" => LogFormat::HumanReadable,
            "compact" => LogFormat::Compact,
            other => return Err(format!("unknown log format: {other}")),
        })
    }
}

fn builder(verbosity: Verbosity) -> SubscriberBuilder<
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format,
    EnvFilter,
> {
    let level: LevelFilter = verbosity.into();
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
}

/// Initialize a global trace subscriber.
///
/// Calling this more than once is a no-op, the first subscriber wins.
pub fn init(verbosity: impl Into<Verbosity>, format: LogFormat) {
    let builder = builder(verbosity.into());
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::HumanReadable => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

/// Initialize logging for tests.
///
/// Output goes through the test harness writer so it is only shown for failing
/// tests.
pub fn init_test() {
    let _ = builder(Verbosity::Debug).with_test_writer().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_count() {
        let test_cases = [
            (0, Verbosity::Info),
            (1, Verbosity::Debug),
            (2, Verbosity::Trace),
            (7, Verbosity::Trace),
        ];

        for (count, expected) in test_cases {
            assert_eq!(expected, Verbosity::from(count));
        }
    }

    #[test]
    fn log_format_parse() {
        for format in [LogFormat::Json, LogFormat::HumanReadable, LogFormat::Compact] {
            let parsed: LogFormat = format.to_string().parse().unwrap();
            assert_eq!(format, parsed);
        }
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn init_twice() {
        init_test();
        init_test();
        tracing::info!("logging initialized");
    }
}
