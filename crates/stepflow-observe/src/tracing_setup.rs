//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use stepflow_observe::{LogFormat, TracingOptions};
//!
//! // Human-readable logs only
//! stepflow_observe::init_tracing(&TracingOptions::default()).unwrap();
//!
//! // JSON lines plus span export to stdout
//! let opts = TracingOptions::default()
//!     .with_format(LogFormat::Json)
//!     .with_otel(true);
//! stepflow_observe::init_tracing(&opts).unwrap();
//! ```

use std::sync::OnceLock;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, Layer as _};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,stepflow_core=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Options for [`init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub enable_otel: bool,
    /// Filter directive applied when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            enable_otel: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TracingOptions {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_otel(mut self, enable: bool) -> Self {
        self.enable_otel = enable;
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// `RUST_LOG` when set and valid, otherwise `default_filter`.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter)
                .with_context(|| format!("invalid filter directive '{}'", self.default_filter)),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer, pretty or JSON, with target visibility and span
///   close timing.
/// - When `enable_otel` is set, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
/// - Respects `RUST_LOG`, falling back to `default_filter`.
///
/// # Errors
///
/// Returns an error if the filter is invalid or the global subscriber has
/// already been set.
pub fn init_tracing(opts: &TracingOptions) -> anyhow::Result<()> {
    let env_filter = opts.env_filter()?;

    let fmt_layer = match opts.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
    };

    let otel_layer = if opts.enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepflow");

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("global tracing subscriber already set")?;

    tracing::debug!(format = ?opts.format, otel = opts.enable_otel, "tracing initialized");
    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
