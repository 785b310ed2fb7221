//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every metric family in the Prometheus text format.
pub fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Content type matching [`encode_registry`] output.
pub fn text_content_type() -> &'static str {
    "text/plain; version=0.0.4"
}

/// Metrics recorded by the fleet poll loop.
#[derive(Clone, Debug)]
pub struct FleetMetrics {
    devices_total: IntGauge,
    polls: IntCounterVec,
    device_online: IntGaugeVec,
    active_alarms: IntGaugeVec,
    tick_seconds: Histogram,
}

impl FleetMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let devices_total = IntGauge::with_opts(Opts::new(
            "bmsmon_devices_total",
            "Number of configured battery devices",
        ))?;
        registry.register(Box::new(devices_total.clone()))?;

        let polls = IntCounterVec::new(
            Opts::new(
                "bmsmon_polls_total",
                "Poll attempts by device and outcome (online/offline)",
            ),
            &["device", "outcome"],
        )?;
        registry.register(Box::new(polls.clone()))?;

        let device_online = IntGaugeVec::new(
            Opts::new(
                "bmsmon_device_online",
                "Indicator (0/1) whether the latest poll of a device succeeded",
            ),
            &["device"],
        )?;
        registry.register(Box::new(device_online.clone()))?;

        let active_alarms = IntGaugeVec::new(
            Opts::new(
                "bmsmon_active_alarms",
                "Number of alarm conditions raised by the latest poll",
            ),
            &["device"],
        )?;
        registry.register(Box::new(active_alarms.clone()))?;

        let buckets = prometheus::exponential_buckets(0.005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let tick_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "bmsmon_tick_seconds",
                "Wall time of one poll-and-publish tick",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(tick_seconds.clone()))?;

        Ok(Self {
            devices_total,
            polls,
            device_online,
            active_alarms,
            tick_seconds,
        })
    }

    pub fn set_device_count(&self, count: usize) {
        self.devices_total.set(count as i64);
    }

    pub fn record_poll(&self, device: &str, online: bool, alarm_count: usize) {
        let outcome = if online { "online" } else { "offline" };
        self.polls.with_label_values(&[device, outcome]).inc();
        self.device_online
            .with_label_values(&[device])
            .set(i64::from(online));
        self.active_alarms
            .with_label_values(&[device])
            .set(alarm_count as i64);
    }

    pub fn observe_tick(&self, seconds: f64) {
        self.tick_seconds.observe(seconds);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_outcomes_are_exported() {
        let registry = new_registry();
        let metrics = FleetMetrics::new(registry.clone()).unwrap();
        metrics.set_device_count(2);
        metrics.record_poll("rack_a", true, 1);
        metrics.record_poll("rack_b", false, 0);
        metrics.observe_tick(0.25);

        let body = encode_registry(&registry).unwrap();
        assert!(body.contains("bmsmon_devices_total 2"));
        assert!(body.contains(r#"bmsmon_polls_total{device="rack_a",outcome="online"} 1"#));
        assert!(body.contains(r#"bmsmon_device_online{device="rack_b"} 0"#));
        assert!(body.contains(r#"bmsmon_active_alarms{device="rack_a"} 1"#));
        assert!(body.contains("bmsmon_tick_seconds_count 1"));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = new_registry();
        FleetMetrics::new(registry.clone()).unwrap();
        assert!(FleetMetrics::new(registry).is_err());
    }
}
