//! Tracing and metrics initialization
//!
//! Both initializers are idempotent so tests and embedding shells can call
//! them freely; the first call wins.

use crate::utils::config::{LoggingSection, MetricsSection};
use crate::utils::errors::{NodeError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();
static METRICS: OnceCell<()> = OnceCell::new();

/// Initialize the tracing subscriber
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init_tracing(config: &LoggingSection) -> Result<()> {
    if TRACING.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| NodeError::Observability(e.to_string()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| NodeError::Observability(e.to_string()))?;

    let _ = TRACING.set(());
    Ok(())
}

/// Install the Prometheus metrics exporter
///
/// No-op when metrics are disabled in configuration. Must be called from
/// within a tokio runtime (the exporter hosts its scrape endpoint on it).
pub fn init_metrics(config: &MetricsSection) -> Result<()> {
    if !config.enabled || METRICS.get().is_some() {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| NodeError::Observability(format!("Invalid metrics listen address: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| NodeError::Observability(e.to_string()))?;

    info!("Metrics exporter listening on {}", addr);
    let _ = METRICS.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = LoggingSection::default();
        init_tracing(&config).unwrap();
        init_tracing(&config).unwrap();
    }

    #[test]
    fn test_disabled_metrics_is_noop() {
        let config = MetricsSection::default();
        assert!(!config.enabled);
        init_metrics(&config).unwrap();
    }
}
