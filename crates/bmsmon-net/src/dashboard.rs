//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP dashboard API serving the latest telemetry batch."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bmsmon_core::{Batch, Publisher, TelemetryExport};
use bmsmon_metrics::{encode_registry, text_content_type, SharedRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Aggregates over the online devices of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetSummary {
    /// Sum of remaining energy in kWh.
    pub total_kwh: f64,
    /// Sum of pack power in W, positive while charging.
    pub total_power: f64,
    /// Mean state of charge in percent, 0 when nothing is online.
    pub average_soc: f64,
    /// Devices that answered this tick.
    pub online: usize,
    /// Devices configured.
    pub total: usize,
}

impl FleetSummary {
    /// Compute the summary from exported telemetry.
    pub fn from_exports(batteries: &[TelemetryExport]) -> Self {
        let online: Vec<&TelemetryExport> = batteries.iter().filter(|b| b.online).collect();
        let total_kwh: f64 = online.iter().map(|b| b.remaining_kwh).sum();
        let total_power: f64 = online.iter().map(|b| b.power).sum();
        let average_soc = if online.is_empty() {
            0.0
        } else {
            online.iter().map(|b| b.soc).sum::<f64>() / online.len() as f64
        };
        Self {
            total_kwh: (total_kwh * 100.0).round() / 100.0,
            total_power: total_power.round(),
            average_soc: (average_soc * 10.0).round() / 10.0,
            online: online.len(),
            total: batteries.len(),
        }
    }
}

/// Body of `GET /api/data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DashboardSnapshot {
    /// Latest export per device, in configuration order.
    pub batteries: Vec<TelemetryExport>,
    /// Whether the MQTT uplink was up when the batch was published.
    pub mqtt_connected: bool,
    /// Fleet aggregates.
    pub summary: FleetSummary,
}

/// Shared holder for the latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct DashboardStore {
    inner: Arc<RwLock<DashboardSnapshot>>,
}

impl DashboardStore {
    /// Empty store; serves no batteries until the first publish.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with one built from `batch`.
    pub fn update(&self, batch: &Batch, mqtt_connected: bool) {
        let batteries: Vec<TelemetryExport> = batch.iter().map(|t| t.export()).collect();
        let summary = FleetSummary::from_exports(&batteries);
        *self.inner.write() = DashboardSnapshot {
            batteries,
            mqtt_connected,
            summary,
        };
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> DashboardSnapshot {
        self.inner.read().clone()
    }
}

/// [`Publisher`] feeding the dashboard store.
#[derive(Debug, Clone)]
pub struct DashboardPublisher {
    store: DashboardStore,
    mqtt_enabled: bool,
}

impl DashboardPublisher {
    /// `mqtt_enabled` decides whether link health is reported as MQTT status.
    pub fn new(store: DashboardStore, mqtt_enabled: bool) -> Self {
        Self {
            store,
            mqtt_enabled,
        }
    }
}

#[async_trait]
impl Publisher for DashboardPublisher {
    fn name(&self) -> &str {
        "dashboard"
    }

    async fn publish(&self, batch: &Batch, link_healthy: bool) {
        self.store.update(batch, self.mqtt_enabled && link_healthy);
    }
}

struct DashboardState {
    store: DashboardStore,
    metrics: Option<SharedRegistry>,
}

/// Builder used to configure and spawn the dashboard server.
#[derive(Debug, Clone)]
pub struct DashboardServerBuilder {
    listen: SocketAddr,
    store: DashboardStore,
    metrics: Option<SharedRegistry>,
}

impl DashboardServerBuilder {
    /// Serve `store` on `listen`.
    pub fn new(listen: SocketAddr, store: DashboardStore) -> Self {
        Self {
            listen,
            store,
            metrics: None,
        }
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Bind the listener and serve until [`DashboardHandle::shutdown`].
    pub async fn spawn(self) -> anyhow::Result<DashboardHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "dashboard listening");

        let state = DashboardState {
            store: self.store,
            metrics: self.metrics,
        };
        let router = Router::new()
            .route("/api/data", get(get_data))
            .route("/healthz", get(get_health))
            .route("/metrics", get(get_metrics))
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "dashboard server exited with error");
            }
        });

        Ok(DashboardHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Running dashboard server.
#[derive(Debug)]
pub struct DashboardHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl DashboardHandle {
    /// Socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

async fn get_data(State(state): State<Arc<DashboardState>>) -> Json<DashboardSnapshot> {
    Json(state.store.snapshot())
}

async fn get_health() -> &'static str {
    "ok"
}

async fn get_metrics(State(state): State<Arc<DashboardState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled").into_response();
    };
    match encode_registry(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, text_content_type())],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(id: &str, online: bool, soc: f64, kwh: f64, power: f64) -> TelemetryExport {
        TelemetryExport {
            name: id.to_uppercase(),
            id: id.into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            online,
            soc,
            soh: 100.0,
            cycle_count: 0,
            status: 0,
            voltage: 53.0,
            current: 0.0,
            power,
            temperature: 25.0,
            design_capacity: 280.0,
            full_capacity: 280.0,
            remaining_ah: 0.0,
            remaining_kwh: kwh,
            max_voltage: 57.6,
            max_current: 200.0,
            cell_count: 16,
            cell_voltages: vec![],
            cell_min: 0.0,
            cell_max: 0.0,
            cell_delta: 0.0,
            alarms: vec![],
            alarm_count: 0,
        }
    }

    #[test]
    fn summary_only_counts_online_devices() {
        let batteries = vec![
            export("a", true, 80.0, 10.5, -120.4),
            export("b", true, 61.0, 7.25, 300.0),
            export("c", false, 0.0, 0.0, 0.0),
        ];
        let summary = FleetSummary::from_exports(&batteries);
        assert_eq!(summary.online, 2);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.total_kwh, 17.75);
        assert_eq!(summary.total_power, 180.0);
        assert_eq!(summary.average_soc, 70.5);
    }

    #[test]
    fn summary_of_offline_fleet_is_zero() {
        let summary = FleetSummary::from_exports(&[export("a", false, 0.0, 0.0, 0.0)]);
        assert_eq!(summary.average_soc, 0.0);
        assert_eq!(summary.online, 0);
    }
}
