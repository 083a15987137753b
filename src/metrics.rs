use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    Contents,
    Raw,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- cache --
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_bytes_written: Counter,

    // -- upstream --
    pub upstream_requests: Family<UpstreamLabels, Counter>,
    pub upstream_failures: Family<UpstreamLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Counter::default();
        registry.register(
            "audiocache_cache_hits",
            "Audio requests served from the local cache",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "audiocache_cache_misses",
            "Audio requests that required an upstream fetch",
            cache_misses.clone(),
        );

        let cache_bytes_written = Counter::default();
        registry.register(
            "audiocache_cache_written_bytes",
            "Bytes written to the local cache",
            cache_bytes_written.clone(),
        );

        let upstream_requests = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "audiocache_upstream_requests",
            "Upstream calls by endpoint",
            upstream_requests.clone(),
        );

        let upstream_failures = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "audiocache_upstream_failures",
            "Failed upstream calls by endpoint",
            upstream_failures.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            cache_bytes_written,
            upstream_requests,
            upstream_failures,
        }
    }

    /// Record one upstream call and, if it failed, one failure.
    pub fn record_upstream(&self, endpoint: Endpoint, ok: bool) {
        let labels = UpstreamLabels { endpoint };
        self.upstream_requests.get_or_create(&labels).inc();
        if !ok {
            self.upstream_failures.get_or_create(&labels).inc();
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
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
