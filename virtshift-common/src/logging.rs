//! Structured logging for the virtshift tooling.
//!
//! Console output for interactive use, JSON output for log aggregation.
//! The level passed at init is the default; `RUST_LOG` overrides it.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging with human-readable console output.
///
/// # Example
/// ```
/// virtshift_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();

    Ok(())
}

/// Initialize logging with JSON output format.
///
/// Suitable for unattended runs whose logs end up in an aggregation
/// pipeline (ELK, Loki and the like).
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true),
        )
        .init();

    Ok(())
}
