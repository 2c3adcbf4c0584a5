//! catbus logging setup
//!
//! Every catbus crate emits structured events through `tracing`. This crate
//! owns the subscriber that turns those events into output, configured from
//! the environment.
//!
//! # Usage
//!
//! ```rust
//! // Once, at process startup.
//! catbus_log::init();
//!
//! tracing::info!(routing_key = "cat.created", "Event published");
//! ```
//!
//! # Environment Variables
//!
//! - `CATBUS_DEBUG=1` - Enable debug logging
//! - `CATBUS_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `CATBUS_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `CATBUS_LOG_COLOR=1|0` - Enable/disable colors
//!
//! `RUST_LOG`, when set, takes precedence over `CATBUS_LOG_LEVEL`.

use once_cell::sync::Lazy;
use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

// ============================================================================
// Log Levels
// ============================================================================

/// Minimum level of events that reach the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level (least verbose)
    Error,
    /// Off (no logging)
    Off,
}

impl Level {
    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_directive())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// One JSON object per line
    Json,
}

impl Format {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

static CONFIG: Lazy<LogConfig> = Lazy::new(LogConfig::from_env);

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether ANSI colors are enabled (ignored for JSON)
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let debug = flag("CATBUS_DEBUG").unwrap_or(false);

        let level = lookup("CATBUS_LOG_LEVEL")
            .and_then(|s| Level::parse(&s))
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("CATBUS_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Json);

        let color = flag("CATBUS_LOG_COLOR")
            .unwrap_or_else(|| lookup("NO_COLOR").is_none() && lookup("TERM").is_some());

        Self {
            debug,
            level,
            format,
            color,
        }
    }

    /// Override the level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Override the format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_directive()))
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Get the configuration read from the environment.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

/// Install the global subscriber using the environment configuration.
///
/// Returns `false` when a global subscriber was already installed, which
/// makes repeated calls (tests, embedded use) harmless.
pub fn init() -> bool {
    init_with(config())
}

/// Install the global subscriber using an explicit configuration.
pub fn init_with(config: &LogConfig) -> bool {
    let registry = tracing_subscriber::registry().with(config.filter());

    let installed = match config.format {
        Format::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        Format::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.color))
            .try_init(),
        Format::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.color))
            .try_init(),
    };

    installed.is_ok()
}

// ============================================================================
// Tests
// ============================================================================
