//! Logging configuration for the pgfleet binary.

use clap::{Args, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Corresponds to [`tracing_subscriber::fmt::format::Compact`]
    Compact,
    /// Corresponds to [`tracing_subscriber::fmt::format::Full`]
    Full,
    /// Corresponds to [`tracing_subscriber::fmt::format::Pretty`]
    Pretty,
    /// Corresponds to [`tracing_subscriber::fmt::format::Json`]
    Json,
}

#[derive(Debug, Args)]
#[group(id = "logging")]
pub struct Options {
    /// Format to use when emitting log events
    #[arg(long, env = "LOG_FORMAT", default_value = "full", value_enum)]
    log_format: LogFormat,

    /// Log level filter for spans and events, as a comma separated list of
    /// directives (see tracing_subscriber::EnvFilter)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Options {
    pub fn init(&self) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(&self.log_level)?;
        let s = tracing_subscriber::fmt().with_env_filter(filter);

        match self.log_format {
            LogFormat::Compact => s.compact().init(),
            LogFormat::Full => s.init(),
            LogFormat::Pretty => s.pretty().init(),
            LogFormat::Json => s.json().with_current_span(true).init(),
        }

        Ok(())
    }
}
