//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Publisher boundary fed by the fleet coordinator."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;

use crate::telemetry::Telemetry;

/// Immutable result of one tick, in configuration order.
pub type Batch = Arc<[Telemetry]>;

/// Consumer of telemetry batches (MQTT, dashboard, terminal).
///
/// `publish` has no error channel: implementations log their own failures
/// and must leave the coordinator free to continue with the next publisher.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, batch: &Batch, link_healthy: bool);

    /// Uplink health, for publishers that have one.
    fn link_healthy(&self) -> Option<bool> {
        None
    }

    async fn shutdown(&self) {}
}
