//! ---
//! ems_section: "02-decode-pipeline"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Register transport abstraction used by device sessions."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;

use crate::error::TransportError;

/// Holding-register access to one physical unit.
///
/// A session owns its transport exclusively, so implementations need not be
/// shareable across tasks.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Read `count` consecutive holding registers starting at `offset`.
    async fn read(&mut self, offset: u16, count: u16) -> Result<Vec<u16>, TransportError>;

    /// Human readable endpoint used in logs.
    fn describe(&self) -> String;
}
