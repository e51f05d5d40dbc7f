mod logger;

pub use logger::{Fields, KeyValLogger, Level, ParseLevelError, TracingLogger};

use itertools::Itertools;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::{collections::VecDeque, str::FromStr};
use tracing_subscriber::{
    fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

const LEVEL_ENV_VAR: &str = "LOOM_LOG_LEVEL";
const FORMAT_ENV_VAR: &str = "LOOM_LOG_FORMAT";
const OUTPUT_ENV_VAR: &str = "LOOM_LOG_OUTPUT";
static TRACING_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[display(fmt = "json")]
    Json,
    #[display(fmt = "pretty")]
    Pretty,
    #[display(fmt = "compact")]
    Compact,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(anyhow::anyhow!("unknown log format {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(LogOutput::Stdout),
            "stderr" => Ok(LogOutput::Stderr),
            other => Err(anyhow::anyhow!("unknown log output {:?}", other)),
        }
    }
}

/// Telemetry configuration options. Construct with [TelemetryOptionsBuilder]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, derive_builder::Builder)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct TelemetryOptions {
    /// Minimum level of events written by the installed subscriber
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Include source file and line in each event
    pub include_source: bool,
    /// An [EnvFilter] directive used instead of `level`, ex: `temporal_loom=debug,info`.
    /// `RUST_LOG` takes precedence over both.
    #[builder(setter(into, strip_option))]
    pub filter: Option<String>,
}

impl TelemetryOptions {
    /// Defaults overridden by the `LOOM_LOG_*` environment variables
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let mut opts = TelemetryOptions::default();
        if let Ok(level) = std::env::var(LEVEL_ENV_VAR) {
            opts.level = level.parse()?;
        }
        if let Ok(format) = std::env::var(FORMAT_ENV_VAR) {
            opts.format = format.parse()?;
        }
        if let Ok(output) = std::env::var(OUTPUT_ENV_VAR) {
            opts.output = output.parse()?;
        }
        Ok(opts)
    }

    fn filter_directive(&self) -> String {
        self.filter
            .clone()
            .unwrap_or_else(|| self.level.as_filter_directive().to_string())
    }
}

/// Initialize tracing subscribers and output. Nothing in this crate calls this itself, it
/// exists so that hosts and tests have an easy way to initialize tracing. Only the first call
/// has any effect.
///
/// The standard `RUST_LOG` env var, if set, is used for filtering. Otherwise the filter comes
/// from the options.
pub fn telemetry_init(opts: &TelemetryOptions) -> Result<(), anyhow::Error> {
    TRACING_INIT
        .get_or_try_init(|| {
            let filter_layer = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(opts.filter_directive()))?;

            let writer = match opts.output {
                LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
                LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
            };
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(opts.include_source)
                .with_line_number(opts.include_source)
                .with_writer(writer);
            let fmt_layer = match opts.format {
                LogFormat::Json => fmt_layer.json().boxed(),
                LogFormat::Pretty => fmt_layer.pretty().boxed(),
                LogFormat::Compact => fmt_layer.compact().boxed(),
            };

            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(filter_layer)
                .try_init()?;
            Ok::<_, anyhow::Error>(())
        })
        .map(|_| ())
}

/// Helps with printing collections of things in tracing events.
///
/// Calling itertools format inline in an `event!` macro can panic because it gets evaluated
/// twice.
pub(crate) trait VecDisplayer {
    fn display(&self) -> String;
}

impl<T> VecDisplayer for Vec<T>
where
    T: std::fmt::Display,
{
    fn display(&self) -> String {
        format!("[{}]", self.iter().format(","))
    }
}

impl<T> VecDisplayer for VecDeque<T>
where
    T: std::fmt::Display,
{
    fn display(&self) -> String {
        format!("[{}]", self.iter().format(","))
    }
}
