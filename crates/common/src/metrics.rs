//! Metrics sink abstraction.
//!
//! Wrappers never touch a process-wide registry. They receive a
//! [`MetricsSink`] at construction and report through it; the binary wires
//! in a [`PrometheusSink`] whose registry it owns and exposes.

use std::collections::HashMap;
use std::fmt;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

/// Requests forwarded upstream, by method, path template and status class
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
/// Upstream latency, by method and path template
pub const HTTP_RESPONSE_TIME_SECONDS: &str = "http_response_time_seconds";
/// Requests seen by the response cache
pub const CACHE_REQUESTS_TOTAL: &str = "cache_requests_total";
/// Requests answered from the response cache
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";

/// Destination for counter increments and histogram observations
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` for the given label set by one
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Record `value` in the histogram `name` for the given label set
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Prometheus-backed sink with the gateway's metric families pre-registered
pub struct PrometheusSink {
    registry: Registry,
    counters: HashMap<&'static str, IntCounterVec>,
    histograms: HashMap<&'static str, HistogramVec>,
}

impl PrometheusSink {
    /// Create a sink with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let mut counters = HashMap::new();
        let mut histograms = HashMap::new();

        let requests = IntCounterVec::new(
            Opts::new(
                HTTP_REQUESTS_TOTAL,
                "Number of requests by path and status code.",
            ),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        counters.insert(HTTP_REQUESTS_TOTAL, requests);

        let duration = HistogramVec::new(
            HistogramOpts::new(HTTP_RESPONSE_TIME_SECONDS, "Duration of HTTP requests."),
            &["method", "path"],
        )?;
        registry.register(Box::new(duration.clone()))?;
        histograms.insert(HTTP_RESPONSE_TIME_SECONDS, duration);

        let cache_requests = IntCounterVec::new(
            Opts::new(
                CACHE_REQUESTS_TOTAL,
                "Number of requests to the cache layer.",
            ),
            &[],
        )?;
        registry.register(Box::new(cache_requests.clone()))?;
        counters.insert(CACHE_REQUESTS_TOTAL, cache_requests);

        let cache_hits = IntCounterVec::new(Opts::new(CACHE_HITS_TOTAL, "Number of cache hits."), &[])?;
        registry.register(Box::new(cache_hits.clone()))?;
        counters.insert(CACHE_HITS_TOTAL, cache_hits);

        Ok(Self {
            registry,
            counters,
            histograms,
        })
    }

    /// Render all metric families in the Prometheus text exposition format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusSink {
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let Some(counter) = self.counters.get(name) else {
            debug!(metric = %name, "Ignoring unknown counter");
            return;
        };
        let labels: HashMap<&str, &str> = labels.iter().copied().collect();
        match counter.get_metric_with(&labels) {
            Ok(c) => c.inc(),
            Err(e) => debug!(metric = %name, error = %e, "Counter label mismatch"),
        }
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let Some(histogram) = self.histograms.get(name) else {
            debug!(metric = %name, "Ignoring unknown histogram");
            return;
        };
        let labels: HashMap<&str, &str> = labels.iter().copied().collect();
        match histogram.get_metric_with(&labels) {
            Ok(h) => h.observe(value),
            Err(e) => debug!(metric = %name, error = %e, "Histogram label mismatch"),
        }
    }
}

impl fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("counters", &self.counters.keys().collect::<Vec<_>>())
            .field("histograms", &self.histograms.keys().collect::<Vec<_>>())
            .finish()
    }
}
