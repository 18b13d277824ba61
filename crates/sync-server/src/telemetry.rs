//! Logging setup for the sync server.
//!
//! Two modes: structured JSON lines for deployments that ship logs to a
//! collector, and pretty console output for local development.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,sync_server=debug,sync_router=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize structured logging for deployment.
///
/// # Configuration
///
/// Environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector endpoint, logged for reference
/// - `OTEL_SERVICE_NAME`: Service name (default: sync-server)
/// - `RUST_LOG`: Log filter (default: `info,sync_server=debug,sync_router=debug`)
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "sync-server".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(
        endpoint = %otlp_endpoint,
        service = %service_name,
        "Telemetry initialized (JSON logs)"
    );

    Ok(())
}

/// Initialize telemetry for local development.
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Local telemetry initialized");

    Ok(())
}

/// Flush and stop telemetry before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
