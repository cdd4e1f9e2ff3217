use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecLabels {
    pub outcome: ExecOutcome,
}

/// How a single `exec` request ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ExecOutcome {
    Completed,
    Malformed,
    Unsupported,
    InvalidRepository,
    DelegateFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- connections --
    pub connections_total: Counter,
    pub handshake_failures_total: Counter,
    pub active_connections: Gauge,

    // -- channels --
    pub channels_rejected_total: Counter,

    // -- exec --
    pub exec_requests_total: Family<ExecLabels, Counter>,
    pub delegate_duration_seconds: Family<OperationLabels, Histogram>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let connections_total = Counter::default();
        registry.register(
            "gitgate_connections",
            "SSH connections that completed the handshake",
            connections_total.clone(),
        );

        let handshake_failures_total = Counter::default();
        registry.register(
            "gitgate_handshake_failures",
            "SSH connections dropped before authentication completed",
            handshake_failures_total.clone(),
        );

        let active_connections: Gauge = Gauge::default();
        registry.register(
            "gitgate_active_connections",
            "Currently open SSH connections",
            active_connections.clone(),
        );

        let channels_rejected_total = Counter::default();
        registry.register(
            "gitgate_channels_rejected",
            "Channel-open requests refused because of their type",
            channels_rejected_total.clone(),
        );

        let exec_requests_total = Family::<ExecLabels, Counter>::default();
        registry.register(
            "gitgate_exec_requests",
            "exec requests by outcome",
            exec_requests_total.clone(),
        );

        let delegate_duration_seconds =
            Family::<OperationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "gitgate_delegate_duration_seconds",
            "Wall-clock run time of delegate processes",
            delegate_duration_seconds.clone(),
        );

        Self {
            connections_total,
            handshake_failures_total,
            active_connections,
            channels_rejected_total,
            exec_requests_total,
            delegate_duration_seconds,
        }
    }

    pub fn record_exec(&self, outcome: ExecOutcome) {
        self.exec_requests_total
            .get_or_create(&ExecLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
