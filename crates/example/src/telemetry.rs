//! Tracing subscriber setup for the demo binary.
//!
//! Library crates only emit `tracing` events; installing a subscriber is the
//! binary's job. [`TracingConfig`] collects the level, output format and
//! filter, and [`TracingConfig::init`] installs a registry with an
//! [`EnvFilter`] and one `fmt` layer.

use core::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

// ─────────────────────────────────────────────────────────────────────────────
// TracingFormat
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable colored output (default).
    #[default]
    Pretty,
    /// Compact single-line output.
    Compact,
    /// JSON structured output for log aggregation.
    Json,
}

/// Error returned when parsing an unknown [`TracingFormat`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tracing format '{0}', expected one of: pretty, compact, json")]
pub struct ParseFormatError(String);

impl FromStr for TracingFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(ParseFormatError(s.to_owned())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing configuration.
///
/// # Example
///
/// ```
/// use example::telemetry::{TracingConfig, TracingFormat};
/// use tracing::Level;
///
/// let config = TracingConfig::default()
///     .with_level(Level::DEBUG)
///     .with_format(TracingFormat::Compact)
///     .with_env_filter("lifescope_store=trace,example=debug");
/// assert_eq!(config.level(), Level::DEBUG);
/// ```
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum log level, used when no filter is given.
    level: Level,
    /// Output format.
    format: TracingFormat,
    /// Environment filter (e.g., `lifescope_store=trace`).
    env_filter: Option<String>,
    /// Whether to include span events (enter/exit).
    span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: TracingFormat::Pretty,
            env_filter: None,
            span_events: false,
        }
    }
}

impl TracingConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration whose filter comes from `RUST_LOG`, if set.
    #[must_use]
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(filter) if !filter.is_empty() => config.with_env_filter(filter),
            _ => config,
        }
    }

    /// Sets the maximum log level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets a custom environment filter string.
    ///
    /// Format: `target=level,target=level,...`
    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Enables span enter/exit events in output.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Returns the configured level.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Returns the configured format.
    #[must_use]
    pub fn format(&self) -> TracingFormat {
        self.format
    }

    /// Builds the filter, falling back to the level on an invalid filter.
    fn filter(&self) -> EnvFilter {
        match &self.env_filter {
            Some(filter) => {
                EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
            }
            None => EnvFilter::new(self.level.as_str()),
        }
    }

    /// Installs the global subscriber.
    ///
    /// Does nothing if a subscriber is already installed.
    pub fn init(&self) {
        let env_filter = self.filter();

        let span_events = if self.span_events {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        };

        let layer = match self.format {
            TracingFormat::Pretty => fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .boxed(),
            TracingFormat::Compact => fmt::layer()
                .compact()
                .with_span_events(span_events)
                .boxed(),
            TracingFormat::Json => fmt::layer()
                .json()
                .with_span_events(span_events)
                .boxed(),
        };

        // Already initialized is not an error here
        let installed = tracing_subscriber::registry()
            .with(layer)
            .with(env_filter)
            .try_init()
            .is_ok();

        if installed {
            tracing::debug!(
                level = %self.level,
                format = ?self.format,
                "tracing initialized"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn format_default_is_pretty() {
        assert_eq!(TracingFormat::default(), TracingFormat::Pretty);
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<TracingFormat>(), Ok(TracingFormat::Json));
        assert_eq!("compact".parse::<TracingFormat>(), Ok(TracingFormat::Compact));
        assert_eq!(
            "xml".parse::<TracingFormat>(),
            Err(ParseFormatError("xml".to_owned()))
        );
    }

    #[test]
    fn config_builders() {
        let config = TracingConfig::new()
            .with_level(Level::TRACE)
            .with_format(TracingFormat::Json)
            .with_env_filter("lifescope_store=trace")
            .with_span_events(true);

        assert_eq!(config.level(), Level::TRACE);
        assert_eq!(config.format(), TracingFormat::Json);
        assert_eq!(config.env_filter.as_deref(), Some("lifescope_store=trace"));
        assert!(config.span_events);
    }

    #[test]
    fn invalid_filter_falls_back_to_level() {
        let config = TracingConfig::new()
            .with_level(Level::WARN)
            .with_env_filter("lifescope_store=loud");
        assert_eq!(config.filter().max_level_hint(), Some(LevelFilter::WARN));
    }
}
