//! Structured logging built on `tracing`
//!
//! ## Log Format Options
//!
//! Controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON for production and log aggregation
//! - `pretty` - Multi-line, coloured output for development
//! - `compact` - Single-line, coloured output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: include span open/close events (default false)
//! - `RUST_LOG`: overrides the filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./zbx-bridge run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies clamped to `warn` unless `RUST_LOG` says otherwise
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc=warn", "hyper=warn", "warp=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse a format name; unknown names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; unknown names fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    let mut filter = EnvFilter::new(level.to_string());
    for directive in QUIET_DEPENDENCIES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber.
///
/// A second call is a no-op so tests and embedding binaries can call it freely.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));
    let spans = span_events(include_spans);

    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Initialise logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span around MQTT subscription work
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Span around one trapper exchange
#[macro_export]
macro_rules! trapper_span {
    ($($field:tt)*) => {
        tracing::info_span!("trapper_send", $($field)*)
    };
}

pub use {mqtt_span, trapper_span};
