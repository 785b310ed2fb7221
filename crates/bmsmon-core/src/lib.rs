//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Decode, alarm, session, and fleet polling core."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Core of the battery monitor: register maps, decoding, alarm evaluation,
//! device sessions and the fleet poll loop.

pub mod alarms;
pub mod decoder;
pub mod error;
pub mod fleet;
pub mod publisher;
pub mod register_map;
pub mod scheduling;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use alarms::{evaluate, Alarm};
pub use decoder::{decode, signed16};
pub use error::{DecodeError, PollError, TransportError};
pub use fleet::FleetCoordinator;
pub use publisher::{Batch, Publisher};
pub use register_map::{CellLayout, RegisterField, RegisterMap};
pub use scheduling::RateLimiter;
pub use session::{DeviceSession, SessionState, DEFAULT_READ_TIMEOUT};
pub use telemetry::{DeviceIdentity, Readings, Telemetry, TelemetryExport};
pub use transport::RegisterTransport;
