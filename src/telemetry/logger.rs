use parking_lot::RwLock;
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

/// Structured logging capability handed to workflow code. `keyvals` are attached to the
/// emitted event as fields.
pub trait KeyValLogger: Send + Sync {
    fn debug(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]);
    fn info(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]);
    fn warn(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]);
    fn error(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Directive understood by `tracing_subscriber::EnvFilter`. Fatal events are emitted at
    /// error level.
    pub(crate) fn as_filter_directive(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error | Level::Fatal => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown log level {0:?}")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// Fields attached to every event of a logger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(BTreeMap<String, String>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: fmt::Display> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// [KeyValLogger] emitting `tracing` events.
///
/// Enrichment never performs I/O: `with_*` return a new logger carrying more fields and sharing
/// this logger's level. Events only leave the process through whatever subscriber the host
/// installed, see [super::telemetry_init].
#[derive(Debug, Clone)]
pub struct TracingLogger {
    level: Arc<RwLock<Level>>,
    fields: Fields,
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(Level::default())
    }
}

impl TracingLogger {
    pub fn new(level: Level) -> Self {
        Self {
            level: Arc::new(RwLock::new(level)),
            fields: Fields::new(),
        }
    }

    pub fn with_field(&self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(key, value);
        Self {
            level: self.level.clone(),
            fields,
        }
    }

    pub fn with_fields(&self, extra: &Fields) -> Self {
        let mut fields = self.fields.clone();
        for (k, v) in &extra.0 {
            fields.0.insert(k.clone(), v.clone());
        }
        Self {
            level: self.level.clone(),
            fields,
        }
    }

    pub fn with_error(&self, err: &(dyn std::error::Error + 'static)) -> Self {
        self.with_field("error", err)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn level(&self) -> Level {
        *self.level.read()
    }

    /// Changes the level of this logger and of every logger derived from it
    pub fn set_level(&self, level: Level) {
        *self.level.write() = level;
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.level()
    }

    /// Log at error level tagged as fatal, then exit the process with status 1
    pub fn fatal(&self, msg: &str) -> ! {
        tracing::error!(level = %Level::Fatal, fields = %self.fields, "{}", msg);
        std::process::exit(1)
    }

    fn emit(&self, level: Level, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]) {
        if !self.enabled(level) {
            return;
        }
        let fields = if keyvals.is_empty() {
            self.fields.clone()
        } else {
            let mut fields = self.fields.clone();
            for (k, v) in keyvals {
                fields.insert(*k, v);
            }
            fields
        };
        match level {
            Level::Debug => tracing::debug!(fields = %fields, "{}", msg),
            Level::Info => tracing::info!(fields = %fields, "{}", msg),
            Level::Warn => tracing::warn!(fields = %fields, "{}", msg),
            Level::Error | Level::Fatal => tracing::error!(fields = %fields, "{}", msg),
        }
    }
}

impl KeyValLogger for TracingLogger {
    fn debug(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]) {
        self.emit(Level::Debug, msg, keyvals)
    }

    fn info(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]) {
        self.emit(Level::Info, msg, keyvals)
    }

    fn warn(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]) {
        self.emit(Level::Warn, msg, keyvals)
    }

    fn error(&self, msg: &str, keyvals: &[(&str, &dyn fmt::Display)]) {
        self.emit(Level::Error, msg, keyvals)
    }
}
