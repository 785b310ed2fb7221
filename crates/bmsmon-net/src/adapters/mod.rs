//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Register transports selected per configured battery."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use bmsmon_common::{BatteryConfig, TransportKind};
use bmsmon_core::RegisterTransport;

pub mod memory;
pub mod modbus;

pub use memory::MemoryRegisterBank;
pub use modbus::ModbusTcpTransport;

/// Build the transport a battery's configuration asks for.
pub fn transport_for(config: &BatteryConfig) -> Box<dyn RegisterTransport> {
    match config.transport {
        TransportKind::Tcp => Box::new(ModbusTcpTransport::from_config(config)),
        TransportKind::Simulated => {
            Box::new(MemoryRegisterBank::simulated(config.slug(), config.protocol))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_follows_configuration() {
        let tcp = BatteryConfig::default();
        assert_eq!(transport_for(&tcp).describe(), "modbus-tcp://192.168.130.139:4196/1");

        let simulated = BatteryConfig {
            name: "Bench Pack".into(),
            transport: TransportKind::Simulated,
            ..BatteryConfig::default()
        };
        assert_eq!(transport_for(&simulated).describe(), "memory://bench_pack");
    }
}
