//! ---
//! ems_section: "02-decode-pipeline"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Threshold evaluation producing ordered alarm conditions."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use bmsmon_common::AlarmThresholds;
use serde::{Deserialize, Serialize};

use crate::telemetry::Readings;

/// Alarm conditions in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Alarm {
    #[serde(rename = "Pack Over-Voltage")]
    PackOverVoltage,
    #[serde(rename = "Pack Under-Voltage")]
    PackUnderVoltage,
    #[serde(rename = "Cell Over-Voltage")]
    CellOverVoltage,
    #[serde(rename = "Cell Under-Voltage")]
    CellUnderVoltage,
    #[serde(rename = "Cell Imbalance")]
    CellImbalance,
    #[serde(rename = "High Temperature")]
    HighTemperature,
    #[serde(rename = "Low Temperature")]
    LowTemperature,
    #[serde(rename = "Critical Low SOC")]
    CriticalLowSoc,
    #[serde(rename = "Over Current")]
    OverCurrent,
}

impl Alarm {
    pub const ALL: [Alarm; 9] = [
        Alarm::PackOverVoltage,
        Alarm::PackUnderVoltage,
        Alarm::CellOverVoltage,
        Alarm::CellUnderVoltage,
        Alarm::CellImbalance,
        Alarm::HighTemperature,
        Alarm::LowTemperature,
        Alarm::CriticalLowSoc,
        Alarm::OverCurrent,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Alarm::PackOverVoltage => "Pack Over-Voltage",
            Alarm::PackUnderVoltage => "Pack Under-Voltage",
            Alarm::CellOverVoltage => "Cell Over-Voltage",
            Alarm::CellUnderVoltage => "Cell Under-Voltage",
            Alarm::CellImbalance => "Cell Imbalance",
            Alarm::HighTemperature => "High Temperature",
            Alarm::LowTemperature => "Low Temperature",
            Alarm::CriticalLowSoc => "Critical Low SOC",
            Alarm::OverCurrent => "Over Current",
        }
    }

    fn is_active(&self, readings: &Readings, limits: &AlarmThresholds) -> bool {
        match self {
            Alarm::PackOverVoltage => readings.voltage > limits.pack_overvoltage,
            Alarm::PackUnderVoltage => readings.voltage < limits.pack_undervoltage,
            Alarm::CellOverVoltage => readings.cell_max > limits.cell_overvoltage,
            Alarm::CellUnderVoltage => readings.cell_min < limits.cell_undervoltage,
            Alarm::CellImbalance => readings.cell_delta() > limits.cell_imbalance_mv,
            Alarm::HighTemperature => readings.temperature > limits.high_temp,
            Alarm::LowTemperature => readings.temperature < limits.low_temp,
            Alarm::CriticalLowSoc => readings.soc < limits.critical_soc,
            Alarm::OverCurrent => readings.current.abs() > limits.overcurrent,
        }
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Every active condition, in the fixed order of [`Alarm::ALL`].
///
/// Only call this on readings from a successful poll.
pub fn evaluate(readings: &Readings, thresholds: &AlarmThresholds) -> Vec<Alarm> {
    Alarm::ALL
        .iter()
        .copied()
        .filter(|alarm| alarm.is_active(readings, thresholds))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> Readings {
        Readings {
            voltage: 53.0,
            soc: 50.0,
            temperature: 25.0,
            current: 10.0,
            cell_min: 3.30,
            cell_max: 3.35,
            ..Readings::default()
        }
    }

    fn labels(alarms: &[Alarm]) -> Vec<&'static str> {
        alarms.iter().map(Alarm::label).collect()
    }

    #[test]
    fn nominal_pack_at_imbalance_threshold_is_quiet() {
        let alarms = evaluate(&nominal(), &AlarmThresholds::default());
        assert!(alarms.is_empty(), "unexpected alarms: {alarms:?}");
    }

    #[test]
    fn critical_soc_alone() {
        let readings = Readings {
            soc: 5.0,
            ..nominal()
        };
        let alarms = evaluate(&readings, &AlarmThresholds::default());
        assert_eq!(labels(&alarms), vec!["Critical Low SOC"]);
    }

    #[test]
    fn pack_overvoltage_alone() {
        let readings = Readings {
            voltage: 58.0,
            ..nominal()
        };
        let alarms = evaluate(&readings, &AlarmThresholds::default());
        assert_eq!(labels(&alarms), vec!["Pack Over-Voltage"]);
    }

    #[test]
    fn multiple_conditions_keep_fixed_order() {
        let readings = Readings {
            voltage: 58.0,
            soc: 5.0,
            cell_min: 2.4,
            cell_max: 2.43,
            ..nominal()
        };
        let alarms = evaluate(&readings, &AlarmThresholds::default());
        assert_eq!(
            labels(&alarms),
            vec!["Pack Over-Voltage", "Cell Under-Voltage", "Critical Low SOC"]
        );
    }

    #[test]
    fn all_conditions_can_fire_except_mutually_exclusive_pairs() {
        let readings = Readings {
            voltage: 40.0,
            current: -250.0,
            temperature: 70.0,
            soc: 1.0,
            cell_min: 2.0,
            cell_max: 3.9,
            ..Readings::default()
        };
        let alarms = evaluate(&readings, &AlarmThresholds::default());
        assert_eq!(
            alarms,
            vec![
                Alarm::PackUnderVoltage,
                Alarm::CellOverVoltage,
                Alarm::CellUnderVoltage,
                Alarm::CellImbalance,
                Alarm::HighTemperature,
                Alarm::CriticalLowSoc,
                Alarm::OverCurrent,
            ]
        );
    }

    #[test]
    fn custom_thresholds_apply() {
        let thresholds = AlarmThresholds {
            low_temp: 5.0,
            ..AlarmThresholds::default()
        };
        let readings = Readings {
            temperature: 2.0,
            ..nominal()
        };
        assert_eq!(evaluate(&readings, &thresholds), vec![Alarm::LowTemperature]);
    }

    #[test]
    fn serializes_as_label() {
        let json = serde_json::to_string(&Alarm::CellImbalance).unwrap();
        assert_eq!(json, "\"Cell Imbalance\"");
        for alarm in Alarm::ALL {
            assert_eq!(
                serde_json::to_value(alarm).unwrap(),
                serde_json::Value::String(alarm.to_string())
            );
        }
    }
}
