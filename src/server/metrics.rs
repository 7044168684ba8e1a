//! Prometheus metrics for the release controller
//!
//! Each controller owns its own `Registry`; `/metrics` encodes it in the text
//! exposition format.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    traffic_weight: IntGaugeVec,
    releases_finished: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "release_reconciliations_total",
                "Reconcile ticks by result",
            ),
            &["result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "release_reconcile_duration_seconds",
                "Time spent in one reconcile tick",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["result"],
        )?;
        let traffic_weight = IntGaugeVec::new(
            Opts::new(
                "release_traffic_weight_percent",
                "Share of traffic routed to the new revision",
            ),
            &["namespace", "release"],
        )?;
        let releases_finished = IntCounterVec::new(
            Opts::new(
                "release_finished_total",
                "Releases that reached a terminal phase",
            ),
            &["strategy", "outcome"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(traffic_weight.clone()))?;
        registry.register(Box::new(releases_finished.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            traffic_weight,
            releases_finished,
        })
    }

    pub fn record_reconcile(&self, result: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.reconcile_duration
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn set_traffic_weight(&self, namespace: &str, release: &str, weight: u8) {
        self.traffic_weight
            .with_label_values(&[namespace, release])
            .set(i64::from(weight));
    }

    pub fn record_release_finished(&self, strategy: &str, outcome: &str) {
        self.releases_finished
            .with_label_values(&[strategy, outcome])
            .inc();
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
