use crate::error::ProxyError;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "forward_relay";

/// Per-proxy Prometheus collectors, registered in a private registry.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    pub connections_accepted: IntCounter,
    pub connections_active: IntGauge,
    pub tunnels: IntCounter,
    pub relays: IntCounter,
    pub rejections: IntCounterVec,
    pub upstream_failures: IntCounterVec,
    pub relayed_body_bytes: IntCounterVec,
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics")
            .field("connections_accepted", &self.connections_accepted.get())
            .field("connections_active", &self.connections_active.get())
            .finish_non_exhaustive()
    }
}

fn metric_error(err: prometheus::Error) -> ProxyError {
    ProxyError::Config(format!("Failed to set up metrics: {}", err))
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, ProxyError> {
        let registry = Registry::new();

        let connections_accepted = IntCounter::with_opts(
            Opts::new("connections_accepted_total", "Client connections accepted").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let connections_active = IntGauge::with_opts(
            Opts::new("connections_active", "Client connections currently being served").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let tunnels = IntCounter::with_opts(
            Opts::new("tunnels_total", "CONNECT tunnels established").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let relays = IntCounter::with_opts(
            Opts::new("relays_total", "Absolute-URI requests relayed to completion").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let rejections = IntCounterVec::new(
            Opts::new("rejections_total", "Requests answered with an error status").namespace(NAMESPACE),
            &["status"],
        )
        .map_err(metric_error)?;
        let upstream_failures = IntCounterVec::new(
            Opts::new("upstream_failures_total", "Failed outbound connection attempts").namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(metric_error)?;
        let relayed_body_bytes = IntCounterVec::new(
            Opts::new("relayed_body_bytes_total", "Message body octets moved by relays").namespace(NAMESPACE),
            &["direction"],
        )
        .map_err(metric_error)?;

        registry.register(Box::new(connections_accepted.clone())).map_err(metric_error)?;
        registry.register(Box::new(connections_active.clone())).map_err(metric_error)?;
        registry.register(Box::new(tunnels.clone())).map_err(metric_error)?;
        registry.register(Box::new(relays.clone())).map_err(metric_error)?;
        registry.register(Box::new(rejections.clone())).map_err(metric_error)?;
        registry.register(Box::new(upstream_failures.clone())).map_err(metric_error)?;
        registry.register(Box::new(relayed_body_bytes.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_active,
            tunnels,
            relays,
            rejections,
            upstream_failures,
            relayed_body_bytes,
        })
    }

    pub fn record_rejection(&self, status: http::StatusCode) {
        self.rejections.with_label_values(&[status.as_str()]).inc();
    }

    pub fn record_upstream_failure(&self, err: &ProxyError) {
        self.upstream_failures.with_label_values(&[err.kind()]).inc();
    }

    pub fn record_relay(&self, request_body_bytes: u64, response_body_bytes: u64) {
        self.relays.inc();
        self.relayed_body_bytes
            .with_label_values(&["request"])
            .inc_by(request_body_bytes);
        self.relayed_body_bytes
            .with_label_values(&["response"])
            .inc_by(response_body_bytes);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String, ProxyError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| ProxyError::Config(format!("Metrics are not UTF-8: {}", e)))
    }
}
