//! Prometheus metrics for the experiment controller
//!
//! Exposed on `/metrics` by the health server.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics handle shared by the controller and the HTTP server
pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    reconcile_duration_seconds: Histogram,
    experiment_events_total: IntCounterVec,
    notifications_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "kokeilu_reconciliations_total",
                "Experiment reconciliations by result",
            ),
            &["result"],
        )?;
        let reconcile_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "kokeilu_reconcile_duration_seconds",
                "Time spent in one experiment sync",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let experiment_events_total = IntCounterVec::new(
            Opts::new(
                "kokeilu_experiment_events_total",
                "Lifecycle events recorded per experiment",
            ),
            &["namespace", "name"],
        )?;
        let notifications_total = IntCounterVec::new(
            Opts::new(
                "kokeilu_notifications_total",
                "Notification sends by trigger and result",
            ),
            &["trigger", "result"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(experiment_events_total.clone()))?;
        registry.register(Box::new(notifications_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            experiment_events_total,
            notifications_total,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["success"])
            .inc();
        self.reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self, duration_secs: f64) {
        self.reconciliations_total.with_label_values(&["error"]).inc();
        self.reconcile_duration_seconds.observe(duration_secs);
    }

    /// Counter bumped for every phase event an experiment records
    pub fn experiment_events(&self) -> &IntCounterVec {
        &self.experiment_events_total
    }

    pub fn record_notification(&self, trigger: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.notifications_total
            .with_label_values(&[trigger, result])
            .inc();
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
