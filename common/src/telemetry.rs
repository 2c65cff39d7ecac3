// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize process-wide structured logging
///
/// `RUST_LOG` takes precedence over the configured level. JSON output carries
/// the current span and thread ids so records from concurrent jobbers can be
/// told apart.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - jobber_deliveries_total: deliveries forwarded, labelled by jobber and outcome
/// - jobber_in_flight: deliveries currently holding a worker slot
/// - broker_reconnects_total: successful broker (re)connections
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "jobber_deliveries_total",
        "Total number of deliveries forwarded by jobbers"
    );
    describe_gauge!(
        "jobber_in_flight",
        "Deliveries currently being forwarded per jobber"
    );
    describe_counter!(
        "broker_reconnects_total",
        "Total number of successful broker connections"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Delivery outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Failure => "failure",
        }
    }
}

#[inline]
pub fn record_delivery(jobber: &str, outcome: DeliveryOutcome) {
    counter!(
        "jobber_deliveries_total",
        "jobber" => jobber.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

#[inline]
pub fn update_in_flight(jobber: &str, in_flight: usize) {
    gauge!("jobber_in_flight", "jobber" => jobber.to_string()).set(in_flight as f64);
}

#[inline]
pub fn record_reconnect() {
    counter!("broker_reconnects_total").increment(1);
}
