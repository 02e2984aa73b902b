//! Metrics module
//!
//! Prometheus metrics for the sync loops, kept in a dedicated registry so
//! several controllers (or tests) never collide on registration.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::Result;

const NAMESPACE: &str = "storage_provisioner";

/// Outcome of one sync step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    Error,
    NotFound,
    /// The queue key could not be decoded
    Skipped,
}

impl ReconcileResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Error => "error",
            ReconcileResult::NotFound => "not_found",
            ReconcileResult::Skipped => "skipped",
        }
    }
}

/// Metrics recorded by the controller
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    requeues: IntCounterVec,
    events: IntCounterVec,
    duration: HistogramVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("reconcile_total", "Total number of sync steps by outcome")
                .namespace(NAMESPACE),
            &["kind", "result"],
        )?;
        let requeues = IntCounterVec::new(
            Opts::new("requeue_total", "Total number of rate-limited requeues")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let events = IntCounterVec::new(
            Opts::new("domain_events_total", "Mutations made by the reconcilers")
                .namespace(NAMESPACE),
            &["type"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Time spent in one sync step",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["kind"],
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(requeues.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            requeues,
            events,
            duration,
        })
    }

    /// Record one sync step of `kind`
    pub fn record_reconcile(&self, kind: &str, result: ReconcileResult, elapsed: Duration) {
        self.reconciles
            .with_label_values(&[kind, result.as_str()])
            .inc();
        self.duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_requeue(&self, kind: &str) {
        self.requeues.with_label_values(&[kind]).inc();
    }

    /// Count one domain event of `event_type`
    pub fn record_event(&self, event_type: &str) {
        self.events.with_label_values(&[event_type]).inc();
    }

    pub fn reconcile_count(&self, kind: &str, result: ReconcileResult) -> u64 {
        self.reconciles
            .with_label_values(&[kind, result.as_str()])
            .get()
    }

    pub fn requeue_count(&self, kind: &str) -> u64 {
        self.requeues.with_label_values(&[kind]).get()
    }

    pub fn event_count(&self, event_type: &str) -> u64 {
        self.events.with_label_values(&[event_type]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format.
    ///
    /// Returns the content type alongside the body.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
