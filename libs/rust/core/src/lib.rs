//! Core shared utilities for chainwatch services.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub mod registry;
pub mod server;

pub use registry::{Instrument, MetricRegistry, RegistryError};
pub use server::{start_metrics_server, MetricsServer};

/// Install the global tracing subscriber (idempotent).
///
/// `RUST_LOG` drives filtering (default `info`). Set `CHAINWATCH_JSON_LOG=1`
/// to emit one JSON object per event instead of the human format.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("CHAINWATCH_JSON_LOG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let (json_layer, text_layer) = if json {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false);
            (Some(layer), None)
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true);
            (None, Some(layer))
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(text_layer)
            .try_init()?;
        Ok(())
    })?;
    info!(target: "chainwatch", service, "tracing initialized");
    Ok(())
}
