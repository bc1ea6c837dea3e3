//! Prometheus metrics for the dispatch engine

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Dispatch counters and gauges, registered on their own registry
#[derive(Clone)]
pub struct DispatchMetrics {
    registry: Registry,
    sends: IntCounterVec,
    running_campaigns: IntGauge,
    pacing_denials: IntCounter,
}

impl DispatchMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sends = IntCounterVec::new(
            Opts::new("courier_send_attempts_total", "Send attempts by outcome"),
            &["outcome"],
        )?;
        let running_campaigns =
            IntGauge::new("courier_running_campaigns", "Campaigns currently running")?;
        let pacing_denials = IntCounter::new(
            "courier_pacing_denials_total",
            "Profile capacity requests denied by pacing",
        )?;

        registry.register(Box::new(sends.clone()))?;
        registry.register(Box::new(running_campaigns.clone()))?;
        registry.register(Box::new(pacing_denials.clone()))?;

        Ok(Self {
            registry,
            sends,
            running_campaigns,
            pacing_denials,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_send(&self, outcome: &str) {
        self.sends.with_label_values(&[outcome]).inc();
    }

    pub fn run_started(&self) {
        self.running_campaigns.inc();
    }

    pub fn run_stopped(&self) {
        self.running_campaigns.dec();
    }

    pub fn pacing_denied(&self) {
        self.pacing_denials.inc();
    }

    pub fn sends(&self, outcome: &str) -> u64 {
        self.sends.with_label_values(&[outcome]).get()
    }

    pub fn running(&self) -> i64 {
        self.running_campaigns.get()
    }
}
