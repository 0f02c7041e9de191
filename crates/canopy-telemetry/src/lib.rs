//! # canopy-telemetry
//!
//! A minimal runtime setup helper for the overlay engine's `tracing`
//! instrumentation (§4.11): a `LogConfig`/subscriber-builder split scoped
//! down to what a protocol *library* needs, a development preset (pretty,
//! ANSI, debug) and a production preset (JSON lines, info), both
//! overridable by `RUST_LOG`. OpenTelemetry export, multi-instance
//! correlation IDs, and file rotation are judged out of scope for this
//! crate — they belong to the hosting application (see DESIGN.md).

use tracing_subscriber::{fmt, EnvFilter};

/// Output format presets for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, ANSI-colored, one line per event plus span context.
    Pretty,
    /// Newline-delimited JSON, suitable for log aggregation.
    Json,
}

/// Runtime logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub default_level: String,
}

impl LogConfig {
    /// Pretty, ANSI, debug-level output for local development.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Pretty,
            default_level: "debug".to_string(),
        }
    }

    /// JSON-lines, info-level output for production deployments.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            default_level: "info".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::production()
    }
}

/// Initialize the global `tracing` subscriber from `config`, honoring
/// `RUST_LOG` if set (falling back to `config.default_level` otherwise).
///
/// Idempotent in the sense that it never panics if a subscriber is already
/// set; the second call is simply a no-op, matching how embedding
/// applications that already configured `tracing` themselves should not be
/// disrupted by this crate.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let result = match config.format {
        LogFormat::Pretty => fmt()
            .with_env_filter(env_filter)
            .with_ansi(true)
            .pretty()
            .try_init(),
        LogFormat::Json => fmt().with_env_filter(env_filter).json().try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already initialized, skipping");
    }
}
