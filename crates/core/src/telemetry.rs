// Telemetry Module
//
// Shared tracing setup for the queue server, the worker and sandbox processes.
// Sandbox processes must log to stderr: their stdout carries the task protocol.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, one line per event
    Pretty,
    /// One JSON object per event
    Json,
}

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Configuration for tracing output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, attached to the startup line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "conveyor_engine=debug")
    pub log_filter: Option<String>,
    /// Output format
    pub format: LogFormat,
    /// Output stream
    pub target: LogTarget,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "conveyor".to_string(),
            log_filter: None,
            format: LogFormat::Pretty,
            target: LogTarget::Stdout,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "conveyor")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: "json" for JSON lines, anything else for pretty output
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "conveyor".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            format: match std::env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            target: LogTarget::Stdout,
        }
    }

    /// Set the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Use this filter when none was given by the environment
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        if self.log_filter.is_none() {
            self.log_filter = Some(filter.into());
        }
        self
    }

    /// Write logs to stderr instead of stdout
    pub fn with_stderr(mut self) -> Self {
        self.target = LogTarget::Stderr;
        self
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the global tracing subscriber
///
/// Safe to call more than once; later calls are ignored.
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let layer = match (config.format, config.target) {
        (LogFormat::Json, LogTarget::Stdout) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        (LogFormat::Json, LogTarget::Stderr) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        (LogFormat::Pretty, LogTarget::Stdout) => {
            tracing_subscriber::fmt::layer().with_target(true).boxed()
        }
        (LogFormat::Pretty, LogTarget::Stderr) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let initialized = tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .is_ok();

    if initialized {
        tracing::debug!(service = %config.service_name, "telemetry initialized");
    }
}
