//! Prometheus metrics for keygate.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.
//! Each recorder owns its registry, so several app states (tests) can coexist.

use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};

use crate::models::key::Decision;

pub struct PrometheusRecorder {
    registry: Registry,
    decisions_total: IntCounterVec,
    keys_issued_total: IntCounter,
    keys_swept_total: IntCounter,
    sweep_failures_total: IntCounter,
}

impl PrometheusRecorder {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            opts!("keygate_decisions_total", "Key validations by outcome"),
            &["outcome"],
        )?;
        let keys_issued_total =
            IntCounter::with_opts(opts!("keygate_keys_issued_total", "Keys issued"))?;
        let keys_swept_total = IntCounter::with_opts(opts!(
            "keygate_keys_swept_total",
            "Expired keys removed by the sweeper"
        ))?;
        let sweep_failures_total = IntCounter::with_opts(opts!(
            "keygate_sweep_failures_total",
            "Sweep cycles that failed"
        ))?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(keys_issued_total.clone()))?;
        registry.register(Box::new(keys_swept_total.clone()))?;
        registry.register(Box::new(sweep_failures_total.clone()))?;

        Ok(Self {
            registry,
            decisions_total,
            keys_issued_total,
            keys_swept_total,
            sweep_failures_total,
        })
    }

    pub fn record_decision(&self, decision: &Decision) {
        self.decisions_total
            .with_label_values(&[decision.label()])
            .inc();
    }

    pub fn record_issued(&self) {
        self.keys_issued_total.inc();
    }

    pub fn record_sweep(&self, removed: u64) {
        self.keys_swept_total.inc_by(removed);
    }

    pub fn record_sweep_failure(&self) {
        self.sweep_failures_total.inc();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
