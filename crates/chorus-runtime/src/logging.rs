//! Tracing subscriber setup for the host.
//!
//! Handler invocations run inside a `plugin` span carrying `plugin`,
//! `message_id`, `chat` and `command` (or `task`). Enabling
//! `span_events.close` prints one line per invocation with its busy and
//! idle time.
//!
//! ```rust,ignore
//! let config = chorus_runtime::config::load_config()?;
//! let _guard = chorus_runtime::logging::init_from_config(&config.logging);
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogLevel, LogOutput, LoggingConfig, SpanEventConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber described by `config`.
///
/// With file output the returned guard owns the writer thread; hold it
/// until exit. A second call leaves the first subscriber in place.
pub fn init_from_config(config: &LoggingConfig) -> Option<WorkerGuard> {
    LoggingBuilder::from_config(config).init()
}

/// Assembles the global subscriber.
#[derive(Debug, Clone, Default)]
pub struct LoggingBuilder {
    config: LoggingConfig,
    directives: Vec<String>,
}

impl LoggingBuilder {
    /// Info level, compact lines on stdout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a loaded [`LoggingConfig`]; per-module filters become
    /// directives in module order.
    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut filters: Vec<_> = config.filters.iter().collect();
        filters.sort_by(|a, b| a.0.cmp(b.0));
        Self {
            config: config.clone(),
            directives: filters
                .into_iter()
                .map(|(module, level)| format!("{module}={}", level.as_str()))
                .collect(),
        }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    /// Adds a directive such as `chorus_framework::dispatcher=debug`.
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn span_events(mut self, events: SpanEventConfig) -> Self {
        self.config.span_events = events;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Logs to a daily-rotated file at `path`.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = LogOutput::File;
        self.config.file_path = Some(path.into());
        self
    }

    /// Like [`try_init`](Self::try_init), treating an installed subscriber
    /// as success.
    pub fn init(self) -> Option<WorkerGuard> {
        self.try_init().unwrap_or_default()
    }

    pub fn try_init(self) -> Result<Option<WorkerGuard>, TryInitError> {
        let (layer, guard) = match self.config.output {
            LogOutput::Stdout => (self.layer(std::io::stdout), None),
            LogOutput::Stderr => (self.layer(std::io::stderr), None),
            LogOutput::File => match self.file_appender() {
                Some(appender) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    (self.layer(writer), Some(guard))
                }
                None => {
                    eprintln!("File logging needs a writable file_path, using stdout");
                    (self.layer(std::io::stdout), None)
                }
            },
        };
        tracing_subscriber::registry()
            .with(layer)
            .with(self.filter())
            .try_init()?;
        Ok(guard)
    }

    fn filter(&self) -> EnvFilter {
        // RUST_LOG replaces the configured base level.
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.level.as_str()));
        for directive in &self.directives {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring log directive '{directive}': {e}"),
            }
        }
        filter
    }

    fn layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let config = &self.config;
        let spans = fmt_span(&config.span_events);

        macro_rules! decorated {
            ($layer:expr) => {
                $layer
                    .with_span_events(spans)
                    .with_thread_ids(config.thread_ids)
                    .with_file(config.file_location)
                    .with_line_number(config.file_location)
                    .with_writer(writer)
                    .boxed()
            };
        }

        match config.format {
            #[cfg(feature = "json-log")]
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(spans)
                .with_writer(writer)
                .boxed(),
            #[cfg(not(feature = "json-log"))]
            LogFormat::Json => {
                eprintln!("JSON logging needs the `json-log` feature, using compact");
                decorated!(fmt::layer().compact())
            }
            LogFormat::Compact => decorated!(fmt::layer().compact()),
            LogFormat::Full => decorated!(fmt::layer()),
            LogFormat::Pretty => decorated!(fmt::layer().pretty()),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.config.file_path.as_ref()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = path
            .file_name()
            .unwrap_or_else(|| OsStr::new("chorus.log"))
            .to_string_lossy()
            .into_owned();
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files((self.config.max_files as usize).max(1))
            .build(dir)
            .map_err(|e| eprintln!("Cannot open log file {}: {e}", path.display()))
            .ok()
    }
}

fn fmt_span(events: &SpanEventConfig) -> FmtSpan {
    [
        (events.new, FmtSpan::NEW),
        (events.enter, FmtSpan::ENTER),
        (events.exit, FmtSpan::EXIT),
        (events.close, FmtSpan::CLOSE),
    ]
    .into_iter()
    .filter(|(on, _)| *on)
    .fold(FmtSpan::NONE, |acc, (_, span)| acc | span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_orders_module_filters() {
        let mut config = LoggingConfig {
            level: LogLevel::Warn,
            ..LoggingConfig::default()
        };
        config
            .filters
            .insert("chorus_runtime::pump".into(), LogLevel::Debug);
        config
            .filters
            .insert("chorus_framework::dispatcher".into(), LogLevel::Trace);

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.config.level.as_str(), "warn");
        assert_eq!(
            builder.directives,
            vec![
                "chorus_framework::dispatcher=trace".to_string(),
                "chorus_runtime::pump=debug".to_string(),
            ]
        );
    }

    #[test]
    fn test_span_flags_map_to_fmt_events() {
        let close_only = SpanEventConfig {
            close: true,
            ..SpanEventConfig::default()
        };
        assert_eq!(fmt_span(&close_only), FmtSpan::CLOSE);
        assert_eq!(fmt_span(&SpanEventConfig::default()), FmtSpan::NONE);
    }

    #[test]
    fn test_file_appender_needs_a_path() {
        let mut builder = LoggingBuilder::new();
        builder.config.output = LogOutput::File;
        assert!(builder.file_appender().is_none());

        let dir = tempfile::tempdir().unwrap();
        let builder = LoggingBuilder::new().file(dir.path().join("host.log"));
        assert!(builder.file_appender().is_some());
    }
}
