// Structured logging module using tracing
// Builds an explicit dispatcher handle; nothing is installed as the global default

use crate::config::{GlobalConfig, LogEncoding};
use crate::error::HarnessError;
use std::str::FromStr;
use tracing::Dispatch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Logger handle created once at startup and passed to whoever needs it.
#[derive(Clone, Debug)]
pub struct Logger {
    dispatch: Dispatch,
    level: LevelFilter,
    encoding: LogEncoding,
}

impl Logger {
    /// Console logger at info, used until the configured logger exists.
    pub fn bootstrap() -> Self {
        LoggerFactory::assemble(LogEncoding::Console, LevelFilter::INFO, std::io::stderr)
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn encoding(&self) -> LogEncoding {
        self.encoding
    }

    /// Runs `f` with this logger as the current subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

/// Parses a textual severity name (trace, debug, info, warn, error, off).
pub fn parse_level(raw: &str) -> Result<LevelFilter, HarnessError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(HarnessError::InvalidLevel(raw.to_string()));
    }
    LevelFilter::from_str(trimmed).map_err(|_| HarnessError::InvalidLevel(raw.to_string()))
}

pub struct LoggerFactory;

impl LoggerFactory {
    /// Builds a logger writing to stderr.
    pub fn build(config: &GlobalConfig) -> Result<Logger, HarnessError> {
        Self::build_with_writer(config, std::io::stderr)
    }

    pub fn build_with_writer<W>(config: &GlobalConfig, writer: W) -> Result<Logger, HarnessError>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let level = parse_level(&config.log_level)?;
        Ok(Self::assemble(config.log_encoding, level, writer))
    }

    fn assemble<W>(encoding: LogEncoding, level: LevelFilter, writer: W) -> Logger
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let env_filter = EnvFilter::default().add_directive(level.into());

        let dispatch = match encoding {
            LogEncoding::Json => Dispatch::new(
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(writer)
                    .json()
                    .with_current_span(false)
                    .with_span_list(true)
                    .finish(),
            ),
            LogEncoding::Console => Dispatch::new(
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(writer)
                    .finish(),
            ),
        };

        Logger {
            dispatch,
            level,
            encoding,
        }
    }
}
