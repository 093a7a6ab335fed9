use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub route: Route,
    pub outcome: Outcome,
}

/// Which dispatcher branch served a request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Route {
    InfoRefs,
    UploadPack,
    Placeholder,
    Unsupported,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Ok,
    RepoNotFound,
    RefNotFound,
    BadGateway,
    UnsupportedUrl,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: Endpoint,
}

/// Upstream call being measured.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    InfoRefs,
    UploadPack,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,

    // -- upstream --
    pub upstream_request_duration_seconds: Family<EndpointLabels, Histogram>,
    pub upstream_errors_total: Family<EndpointLabels, Counter>,

    pub relayed_bytes_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gitref_proxy_requests",
            "Dispatched requests by route and outcome",
            requests_total.clone(),
        );

        let upstream_request_duration_seconds =
            Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            });
        registry.register(
            "gitref_proxy_upstream_request_duration_seconds",
            "Time until upstream response headers arrive, in seconds",
            upstream_request_duration_seconds.clone(),
        );

        let upstream_errors_total = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "gitref_proxy_upstream_errors",
            "Failed upstream calls by endpoint",
            upstream_errors_total.clone(),
        );

        let relayed_bytes_total = Counter::default();
        registry.register(
            "gitref_proxy_relayed_bytes",
            "Upload-pack response bytes streamed back to clients",
            relayed_bytes_total.clone(),
        );

        Self {
            requests_total,
            upstream_request_duration_seconds,
            upstream_errors_total,
            relayed_bytes_total,
        }
    }

    pub fn record_request(&self, route: Route, outcome: Outcome) {
        self.requests_total
            .get_or_create(&RequestLabels { route, outcome })
            .inc();
    }

    pub fn observe_upstream(&self, endpoint: Endpoint, seconds: f64, failed: bool) {
        let labels = EndpointLabels { endpoint };
        self.upstream_request_duration_seconds
            .get_or_create(&labels)
            .observe(seconds);
        if failed {
            self.upstream_errors_total.get_or_create(&labels).inc();
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
