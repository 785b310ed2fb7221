//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Register transports and telemetry publishers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod adapters;
pub mod dashboard;
pub mod mqtt;

pub use adapters::{transport_for, MemoryRegisterBank, ModbusTcpTransport};
pub use dashboard::{
    DashboardHandle, DashboardPublisher, DashboardServerBuilder, DashboardSnapshot,
    DashboardStore, FleetSummary,
};
pub use mqtt::{
    attributes_payload, attributes_topic, discovery_messages, state_payload, state_topic,
    DiscoveryMessage, MqttPublisher, SensorDescriptor, SENSORS,
};
