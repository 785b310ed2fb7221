//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory holding-register bank for simulated batteries."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bmsmon_common::Protocol;
use bmsmon_core::register_map::{alternate, standard};
use bmsmon_core::{RegisterTransport, TransportError};
use tokio::sync::Mutex;

/// In-memory register bank that behaves like a BMS answering holding-register
/// reads. Clones share the same registers, so a test can keep one handle and
/// hand another to a session.
#[derive(Debug, Clone)]
pub struct MemoryRegisterBank {
    label: String,
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    reachable: Arc<AtomicBool>,
    connected: bool,
}

impl MemoryRegisterBank {
    /// Empty bank; unset registers read as zero.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_registers(label, HashMap::new())
    }

    fn with_registers(label: impl Into<String>, registers: HashMap<u16, u16>) -> Self {
        Self {
            label: label.into(),
            registers: Arc::new(Mutex::new(registers)),
            reachable: Arc::new(AtomicBool::new(true)),
            connected: false,
        }
    }

    /// Bank preloaded with a healthy, lightly discharging 16-cell pack laid
    /// out for `protocol`.
    pub fn simulated(label: impl Into<String>, protocol: Protocol) -> Self {
        let seed = match protocol {
            Protocol::Standard => standard_pack(),
            Protocol::Alternate => alternate_pack(),
        };
        Self::with_registers(label, seed.into_iter().collect())
    }

    /// Read a range of holding registers.
    pub async fn read_holding_registers(&self, start: u16, count: u16) -> Vec<u16> {
        let registers = self.registers.lock().await;
        (0..count)
            .map(|offset| {
                let addr = start.wrapping_add(offset);
                registers.get(&addr).copied().unwrap_or(0)
            })
            .collect()
    }

    /// Write a single holding register.
    pub async fn write_holding_register(&self, address: u16, value: u16) {
        self.registers.lock().await.insert(address, value);
    }

    /// Write consecutive holding registers starting at `start`.
    pub async fn write_holding_registers(&self, start: u16, values: &[u16]) {
        let mut registers = self.registers.lock().await;
        for (offset, value) in values.iter().enumerate() {
            registers.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    /// Simulate the device dropping off (or returning to) the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

fn standard_pack() -> Vec<(u16, u16)> {
    let mut words = vec![
        (standard::SOC.offset, 76),
        (standard::SOH.offset, 99),
        (standard::VOLTAGE.offset, 5312),
        // -8.40 A, discharging.
        (standard::CURRENT.offset, (-840i16) as u16),
        (standard::REMAINING_KWH.offset, 1131),
        (standard::DESIGN_CAPACITY.offset, 28000),
        (standard::FULL_CAPACITY.offset, 27720),
        (standard::REMAINING_AH.offset, 2128),
        (standard::TEMPERATURE.offset, 236),
        (standard::MAX_VOLTAGE.offset, 5760),
        (standard::MAX_CURRENT.offset, 20000),
        (standard::CYCLE_COUNT.offset, 42),
        (standard::STATUS.offset, 0),
        (standard::CELL_COUNT.offset, 16),
    ];
    words.extend(cell_words(standard::CELL_VOLTAGE_START));
    words
}

fn alternate_pack() -> Vec<(u16, u16)> {
    let mut words = vec![
        (alternate::CURRENT.offset, (-840i16) as u16),
        (alternate::VOLTAGE.offset, 5312),
        (alternate::SOC.offset, 76),
        (alternate::SOH.offset, 99),
        (alternate::REMAINING_AH.offset, 2128),
        (alternate::FULL_CAPACITY.offset, 28000),
        (alternate::DESIGN_CAPACITY.offset, 28000),
    ];
    words.extend(cell_words(alternate::CELL_VOLTAGE_START));
    words.extend(
        alternate::TEMPERATURE_SENSORS
            .iter()
            .zip([231u16, 236, 240, 0xFFFF, 0xFFFF])
            .map(|(field, raw)| (field.offset, raw)),
    );
    words
}

fn cell_words(start: u16) -> impl Iterator<Item = (u16, u16)> {
    (0..16u16).map(move |i| (start + i, 3315 + (i % 4) * 3))
}

#[async_trait]
impl RegisterTransport for MemoryRegisterBank {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.is_reachable() {
            return Err(TransportError::Connect {
                endpoint: self.describe(),
                reason: "simulated device unreachable".into(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read(&mut self, offset: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !self.is_reachable() {
            self.connected = false;
            return Err(TransportError::Read {
                offset,
                count,
                reason: "simulated device stopped responding".into(),
            });
        }
        Ok(self.read_holding_registers(offset, count).await)
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmsmon_core::decode;

    #[tokio::test]
    async fn register_bank_read_write_cycle() {
        let bank = MemoryRegisterBank::new("bench");
        bank.write_holding_register(1, 123).await;
        bank.write_holding_registers(2, &[456, 789]).await;
        assert_eq!(bank.read_holding_registers(0, 4).await, vec![0, 123, 456, 789]);
    }

    #[tokio::test]
    async fn clones_share_registers_and_reachability() {
        let handle = MemoryRegisterBank::new("bench");
        let mut transport = handle.clone();
        transport.connect().await.unwrap();
        handle.write_holding_register(7, 99).await;
        assert_eq!(transport.read(7, 1).await.unwrap(), vec![99]);

        handle.set_reachable(false);
        assert!(transport.read(7, 1).await.is_err());
        assert!(!transport.is_connected());
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn simulated_packs_decode_cleanly() {
        let standard_bank = MemoryRegisterBank::simulated("a", Protocol::Standard);
        let main = standard_bank.read_holding_registers(0, 60).await;
        let cells = standard_bank.read_holding_registers(113, 16).await;
        let readings = decode(Protocol::Standard, &main, &cells).unwrap();
        assert_eq!(readings.voltage, 53.12);
        assert_eq!(readings.current, -8.4);
        assert_eq!(readings.cell_count, 16);

        let alternate_bank = MemoryRegisterBank::simulated("b", Protocol::Alternate);
        let main = alternate_bank.read_holding_registers(0, 40).await;
        let readings = decode(Protocol::Alternate, &main, &main[15..31]).unwrap();
        assert_eq!(readings.voltage, 53.12);
        assert_eq!(readings.cell_count, 16);
        assert_eq!(readings.cell_min, 3.315);
        assert_eq!(readings.cell_max, 3.324);
    }
}
