//! ---
//! ems_section: "02-decode-pipeline"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Normalized per-device telemetry snapshots and their export form."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Telemetry snapshots produced once per poll.
//!
//! [`Readings`] carries the decoded numbers; [`Telemetry`] binds them to a
//! device identity, a timestamp and the alarm state. Offline snapshots hold
//! default readings and never carry alarms.

use bmsmon_common::{AlarmThresholds, BatteryConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::alarms::{self, Alarm};

/// Display name and slug of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub id: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = bmsmon_common::slugify(&name);
        Self { name, id }
    }
}

impl From<&BatteryConfig> for DeviceIdentity {
    fn from(config: &BatteryConfig) -> Self {
        Self::new(config.name.clone())
    }
}

/// Decoded values of one successful poll, in engineering units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub soc: f64,
    pub soh: f64,
    pub cycle_count: u32,
    pub status: u16,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub design_capacity: f64,
    pub full_capacity: f64,
    pub remaining_ah: f64,
    pub remaining_kwh: f64,
    pub max_voltage: f64,
    pub max_current: f64,
    pub cell_count: u16,
    pub cell_voltages: Vec<f64>,
    /// Lowest valid cell voltage, 0 when no cell is valid.
    pub cell_min: f64,
    /// Highest valid cell voltage, 0 when no cell is valid.
    pub cell_max: f64,
}

impl Readings {
    /// Pack power in watts, positive while charging.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// Spread between the highest and lowest valid cell in millivolts.
    ///
    /// Quantised to whole microvolts so a spread sitting exactly on a
    /// threshold does not trip it through float noise.
    pub fn cell_delta(&self) -> f64 {
        let microvolts = ((self.cell_max - self.cell_min) * 1_000_000.0).round();
        (microvolts / 1000.0).max(0.0)
    }
}

/// One snapshot of one device at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    identity: DeviceIdentity,
    timestamp: DateTime<Utc>,
    online: bool,
    readings: Readings,
    alarms: Vec<Alarm>,
}

impl Telemetry {
    /// Snapshot for a device that could not be read this cycle.
    pub fn offline(identity: DeviceIdentity, timestamp: DateTime<Utc>) -> Self {
        Self {
            identity,
            timestamp,
            online: false,
            readings: Readings::default(),
            alarms: Vec::new(),
        }
    }

    /// Snapshot for a successful read; alarms are evaluated here.
    pub fn online(
        identity: DeviceIdentity,
        timestamp: DateTime<Utc>,
        readings: Readings,
        thresholds: &AlarmThresholds,
    ) -> Self {
        let alarms = alarms::evaluate(&readings, thresholds);
        Self {
            identity,
            timestamp,
            online: true,
            readings,
            alarms,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn readings(&self) -> &Readings {
        &self.readings
    }

    pub fn power(&self) -> f64 {
        self.readings.power()
    }

    pub fn cell_delta(&self) -> f64 {
        self.readings.cell_delta()
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    pub fn alarm_count(&self) -> usize {
        self.alarms.len()
    }

    pub fn has_alarms(&self) -> bool {
        !self.alarms.is_empty()
    }

    pub fn export(&self) -> TelemetryExport {
        TelemetryExport::from(self)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Serializable, display-rounded view of a [`Telemetry`].
///
/// This is the shape consumed by the dashboard, MQTT state payloads and the
/// one-shot JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryExport {
    pub name: String,
    pub id: String,
    pub timestamp: String,
    pub online: bool,
    pub soc: f64,
    pub soh: f64,
    pub cycle_count: u32,
    pub status: u16,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub temperature: f64,
    pub design_capacity: f64,
    pub full_capacity: f64,
    pub remaining_ah: f64,
    pub remaining_kwh: f64,
    pub max_voltage: f64,
    pub max_current: f64,
    pub cell_count: u16,
    pub cell_voltages: Vec<f64>,
    pub cell_min: f64,
    pub cell_max: f64,
    pub cell_delta: f64,
    pub alarms: Vec<String>,
    pub alarm_count: usize,
}

impl From<&Telemetry> for TelemetryExport {
    fn from(telemetry: &Telemetry) -> Self {
        let r = &telemetry.readings;
        Self {
            name: telemetry.identity.name.clone(),
            id: telemetry.identity.id.clone(),
            timestamp: telemetry
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            online: telemetry.online,
            soc: r.soc,
            soh: r.soh,
            cycle_count: r.cycle_count,
            status: r.status,
            voltage: round_to(r.voltage, 2),
            current: round_to(r.current, 2),
            power: round_to(r.power(), 1),
            temperature: round_to(r.temperature, 1),
            design_capacity: round_to(r.design_capacity, 2),
            full_capacity: round_to(r.full_capacity, 2),
            remaining_ah: round_to(r.remaining_ah, 1),
            remaining_kwh: round_to(r.remaining_kwh, 2),
            max_voltage: round_to(r.max_voltage, 2),
            max_current: round_to(r.max_current, 2),
            cell_count: r.cell_count,
            cell_voltages: r.cell_voltages.iter().map(|v| round_to(*v, 3)).collect(),
            cell_min: round_to(r.cell_min, 3),
            cell_max: round_to(r.cell_max, 3),
            cell_delta: round_to(r.cell_delta(), 1),
            alarms: telemetry.alarms.iter().map(|a| a.label().to_string()).collect(),
            alarm_count: telemetry.alarms.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn nominal() -> Readings {
        Readings {
            soc: 80.0,
            soh: 99.0,
            voltage: 53.12,
            current: -12.34,
            temperature: 24.6,
            remaining_kwh: 8.21,
            remaining_ah: 160.4,
            cell_count: 16,
            cell_voltages: vec![3.321; 16],
            cell_min: 3.312,
            cell_max: 3.334,
            ..Readings::default()
        }
    }

    #[test]
    fn slug_identity_from_name() {
        let identity = DeviceIdentity::new("EG4 WallMount #1");
        assert_eq!(identity.id, "eg4_wallmount_1");
        assert_eq!(identity.name, "EG4 WallMount #1");
    }

    #[test]
    fn offline_snapshot_is_empty() {
        let telemetry = Telemetry::offline(DeviceIdentity::new("Rack A"), ts());
        assert!(!telemetry.is_online());
        assert_eq!(telemetry.readings(), &Readings::default());
        assert_eq!(telemetry.alarm_count(), 0);
        assert_eq!(telemetry.power(), 0.0);
        assert_eq!(telemetry.cell_delta(), 0.0);
    }

    #[test]
    fn power_is_derived_from_voltage_and_current() {
        let readings = nominal();
        assert_eq!(readings.power(), 53.12 * -12.34);
    }

    #[test]
    fn cell_delta_in_millivolts() {
        let readings = nominal();
        assert_eq!(readings.cell_delta(), 22.0);
        let at_threshold = Readings {
            cell_min: 3.30,
            cell_max: 3.35,
            ..Readings::default()
        };
        assert_eq!(at_threshold.cell_delta(), 50.0);
    }

    #[test]
    fn alarm_count_matches_alarm_list() {
        let readings = Readings {
            soc: 5.0,
            ..nominal()
        };
        let telemetry = Telemetry::online(
            DeviceIdentity::new("Rack A"),
            ts(),
            readings,
            &AlarmThresholds::default(),
        );
        assert_eq!(telemetry.alarm_count(), telemetry.alarms().len());
        assert_eq!(telemetry.alarm_count(), 1);
    }

    #[test]
    fn export_rounds_for_display() {
        let telemetry = Telemetry::online(
            DeviceIdentity::new("Rack A"),
            ts(),
            nominal(),
            &AlarmThresholds::default(),
        );
        let export = telemetry.export();
        assert_eq!(export.id, "rack_a");
        assert_eq!(export.timestamp, "2024-05-01T12:00:00Z");
        assert_eq!(export.voltage, 53.12);
        assert_eq!(export.current, -12.34);
        assert_eq!(export.power, -655.5);
        assert_eq!(export.temperature, 24.6);
        assert_eq!(export.cell_delta, 22.0);
        assert_eq!(export.cell_voltages.len(), 16);
        assert!(export.alarms.is_empty());

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["online"], true);
        assert_eq!(json["alarm_count"], 0);
    }
}
