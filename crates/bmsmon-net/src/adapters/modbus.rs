//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Modbus TCP holding-register transport."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;

use async_trait::async_trait;
use bmsmon_common::BatteryConfig;
use bmsmon_core::{RegisterTransport, TransportError};
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;
use tracing::debug;

/// Holding-register client for one BMS reachable over Modbus TCP
/// (usually through an RS485 to Ethernet gateway).
pub struct ModbusTcpTransport {
    host: String,
    port: u16,
    unit: u8,
    context: Option<Context>,
}

impl std::fmt::Debug for ModbusTcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("unit", &self.unit)
            .field("connected", &self.context.is_some())
            .finish()
    }
}

impl ModbusTcpTransport {
    /// Transport for `host:port` addressing Modbus unit `unit`.
    pub fn new(host: impl Into<String>, port: u16, unit: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit,
            context: None,
        }
    }

    /// Transport for the endpoint of a configured battery.
    pub fn from_config(config: &BatteryConfig) -> Self {
        Self::new(config.ip.clone(), config.port, config.device_id)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Owned arguments keep the connect future `Send`; `Context` is not `Sync`.
async fn resolve(host: String, port: u16) -> Result<SocketAddr, TransportError> {
    let endpoint = || format!("{host}:{port}");
    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|err| TransportError::Connect {
            endpoint: endpoint(),
            reason: format!("address resolution failed: {err}"),
        })?;
    addrs.next().ok_or_else(|| TransportError::Connect {
        endpoint: endpoint(),
        reason: "address resolved to nothing".into(),
    })
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let addr = resolve(self.host.clone(), self.port).await?;
        let context = tcp::connect_slave(addr, Slave(self.unit))
            .await
            .map_err(|err| TransportError::Connect {
                endpoint: self.endpoint(),
                reason: err.to_string(),
            })?;
        debug!(endpoint = %addr, unit = self.unit, "modbus tcp session opened");
        self.context = Some(context);
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Dropping the context closes the socket.
        if self.context.take().is_some() {
            debug!(endpoint = %self.endpoint(), "modbus tcp session closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    async fn read(&mut self, offset: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let context = self.context.as_mut().ok_or(TransportError::NotConnected)?;
        context
            .read_holding_registers(offset, count)
            .await
            .map_err(|err| TransportError::Read {
                offset,
                count,
                reason: err.to_string(),
            })
    }

    fn describe(&self) -> String {
        format!("modbus-tcp://{}:{}/{}", self.host, self.port, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_without_connection_is_rejected() {
        let mut transport = ModbusTcpTransport::new("127.0.0.1", 502, 1);
        assert!(!transport.is_connected());
        let err = transport.read(0, 60).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn refused_connection_maps_to_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = ModbusTcpTransport::new("127.0.0.1", port, 1);
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn connect_can_run_on_a_spawned_task() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport: Box<dyn RegisterTransport> =
            Box::new(ModbusTcpTransport::new("127.0.0.1", port, 1));
        let outcome = tokio::spawn(async move {
            let result = transport.connect().await;
            (result, transport.is_connected())
        })
        .await
        .unwrap();
        assert!(outcome.0.is_err());
        assert!(!outcome.1);
    }

    #[tokio::test]
    async fn literal_address_resolves_without_lookup() {
        let addr = resolve("127.0.0.1".into(), 4196).await.unwrap();
        assert_eq!(addr, "127.0.0.1:4196".parse::<SocketAddr>().unwrap());
    }
}
