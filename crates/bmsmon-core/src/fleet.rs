//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet poll loop driving sessions and publishers each tick."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bmsmon_metrics::FleetMetrics;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::publisher::{Batch, Publisher};
use crate::scheduling::RateLimiter;
use crate::session::DeviceSession;

/// Polls every session once per tick and fans the batch out to publishers.
pub struct FleetCoordinator {
    sessions: Vec<DeviceSession>,
    publishers: Vec<Arc<dyn Publisher>>,
    interval: Duration,
    metrics: Option<FleetMetrics>,
    tick: u64,
}

impl std::fmt::Debug for FleetCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetCoordinator")
            .field("sessions", &self.sessions)
            .field(
                "publishers",
                &self.publishers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("interval", &self.interval)
            .field("tick", &self.tick)
            .finish()
    }
}

impl FleetCoordinator {
    pub fn new(sessions: Vec<DeviceSession>, interval: Duration) -> Self {
        Self {
            sessions,
            publishers: Vec::new(),
            interval,
            metrics: None,
            tick: 0,
        }
    }

    /// Publishers are invoked in registration order.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        metrics.set_device_count(self.sessions.len());
        self.metrics = Some(metrics);
        self
    }

    pub fn sessions(&self) -> &[DeviceSession] {
        &self.sessions
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Poll all sessions concurrently; the batch keeps configuration order.
    pub async fn poll_all(&mut self) -> Batch {
        let polls = self.sessions.iter_mut().map(|session| session.poll());
        let batch: Batch = join_all(polls).await.into();
        if let Some(metrics) = &self.metrics {
            for telemetry in batch.iter() {
                metrics.record_poll(
                    telemetry.id(),
                    telemetry.is_online(),
                    telemetry.alarm_count(),
                );
            }
        }
        batch
    }

    /// Conjunction of every reported uplink state; `true` when none report.
    pub fn link_healthy(&self) -> bool {
        self.publishers
            .iter()
            .filter_map(|publisher| publisher.link_healthy())
            .all(|healthy| healthy)
    }

    /// One poll of every device followed by one publish per publisher.
    ///
    /// A publisher that panics is logged and skipped. That needs an unwinding
    /// build; the workspace release profile sets `panic = "unwind"`.
    pub async fn run_tick(&mut self) -> Batch {
        self.tick += 1;
        let started = Instant::now();
        let batch = self.poll_all().await;
        let online = batch.iter().filter(|t| t.is_online()).count();
        let alarms: usize = batch.iter().map(|t| t.alarm_count()).sum();

        for publisher in &self.publishers {
            let healthy = self.link_healthy();
            let outcome = AssertUnwindSafe(publisher.publish(&batch, healthy))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(
                    tick = self.tick,
                    publisher = publisher.name(),
                    "publisher panicked; continuing with remaining publishers"
                );
            }
        }

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_tick(elapsed.as_secs_f64());
        }
        debug!(
            tick = self.tick,
            devices = batch.len(),
            online,
            alarms,
            elapsed_ms = elapsed.as_millis() as u64,
            "tick complete"
        );
        batch
    }

    /// Tick until `shutdown` fires. An in-flight tick always completes; only
    /// the wait between ticks is interrupted.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut limiter = RateLimiter::new(self.interval);
        info!(
            devices = self.sessions.len(),
            publishers = self.publishers.len(),
            interval_secs = limiter.period().as_secs_f64(),
            "fleet loop started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = limiter.tick() => {}
            }
            self.run_tick().await;
        }
        self.shutdown().await;
    }

    /// Close every session and let publishers release their resources.
    pub async fn shutdown(&mut self) {
        for session in &mut self.sessions {
            session.disconnect().await;
        }
        for publisher in &self.publishers {
            publisher.shutdown().await;
        }
        info!(ticks = self.tick, "fleet loop stopped");
    }
}
