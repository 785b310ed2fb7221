//! ---
//! ems_section: "02-decode-pipeline"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Pure translation of raw register words into readings."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Register decoding for both protocol variants.
//!
//! Decoding is pure: the caller supplies the main block read from register 0
//! and the cell words (wherever they came from) and gets [`Readings`] back.

use bmsmon_common::Protocol;

use crate::error::DecodeError;
use crate::register_map::{alternate, standard, RegisterField, RegisterMap};
use crate::telemetry::Readings;

/// Two's-complement interpretation of a register word.
pub fn signed16(raw: u16) -> i32 {
    i32::from(raw as i16)
}

fn signed_scaled(field: RegisterField, block: &[u16]) -> f64 {
    f64::from(signed16(field.raw(block))) / field.divisor
}

fn check_lengths(protocol: Protocol, main: &[u16], cells: &[u16]) -> Result<(), DecodeError> {
    let map = RegisterMap::for_protocol(protocol);
    let expected_main = usize::from(map.main_block_len);
    if main.len() < expected_main {
        return Err(DecodeError::ShortBlock {
            protocol,
            expected: expected_main,
            actual: main.len(),
        });
    }
    let expected_cells = usize::from(map.cell_voltage_count);
    if cells.len() != expected_cells {
        return Err(DecodeError::CellBlockLength {
            protocol,
            expected: expected_cells,
            actual: cells.len(),
        });
    }
    Ok(())
}

fn min_max(values: &[f64]) -> (f64, f64) {
    let mut iter = values.iter().copied();
    match iter.next() {
        Some(first) => iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))),
        None => (0.0, 0.0),
    }
}

/// Decode one poll worth of registers for `protocol`.
pub fn decode(protocol: Protocol, main: &[u16], cells: &[u16]) -> Result<Readings, DecodeError> {
    check_lengths(protocol, main, cells)?;
    let readings = match protocol {
        Protocol::Standard => decode_standard(main, cells),
        Protocol::Alternate => decode_alternate(main, cells),
    };
    Ok(readings)
}

fn decode_standard(main: &[u16], cells: &[u16]) -> Readings {
    let divisor = standard::MAP.cell_divisor;
    let cell_voltages: Vec<f64> = cells.iter().map(|raw| f64::from(*raw) / divisor).collect();
    let (cell_min, cell_max) = min_max(&cell_voltages);

    Readings {
        soc: standard::SOC.scaled(main),
        soh: standard::SOH.scaled(main),
        cycle_count: u32::from(standard::CYCLE_COUNT.raw(main)),
        status: standard::STATUS.raw(main),
        voltage: standard::VOLTAGE.scaled(main),
        current: signed_scaled(standard::CURRENT, main),
        temperature: standard::TEMPERATURE.scaled(main),
        design_capacity: standard::DESIGN_CAPACITY.scaled(main),
        full_capacity: standard::FULL_CAPACITY.scaled(main),
        remaining_ah: standard::REMAINING_AH.scaled(main),
        remaining_kwh: standard::REMAINING_KWH.scaled(main),
        max_voltage: standard::MAX_VOLTAGE.scaled(main),
        max_current: standard::MAX_CURRENT.scaled(main),
        cell_count: standard::CELL_COUNT.raw(main),
        cell_voltages,
        cell_min,
        cell_max,
    }
}

fn decode_alternate(main: &[u16], cells: &[u16]) -> Readings {
    let divisor = alternate::MAP.cell_divisor;
    let (low, high) = alternate::CELL_VALID_RANGE;
    let installed: Vec<f64> = cells
        .iter()
        .filter(|raw| **raw != alternate::CELL_NOT_INSTALLED)
        .map(|raw| f64::from(*raw) / divisor)
        .collect();
    let valid: Vec<f64> = installed
        .iter()
        .copied()
        .filter(|v| *v > low && *v < high)
        .collect();
    let (cell_min, cell_max) = min_max(&valid);

    let probes: Vec<f64> = alternate::TEMPERATURE_SENSORS
        .iter()
        .filter(|field| field.raw(main) < alternate::TEMPERATURE_ABSENT_FROM)
        .map(|field| field.scaled(main))
        .collect();
    let temperature = if probes.is_empty() {
        0.0
    } else {
        probes.iter().sum::<f64>() / probes.len() as f64
    };

    let voltage = alternate::VOLTAGE.scaled(main);
    let remaining_ah = alternate::REMAINING_AH.scaled(main);

    Readings {
        soc: alternate::SOC.scaled(main),
        soh: alternate::SOH.scaled(main),
        cycle_count: 0,
        status: 0,
        voltage,
        current: signed_scaled(alternate::CURRENT, main),
        temperature,
        design_capacity: alternate::DESIGN_CAPACITY.scaled(main),
        full_capacity: alternate::FULL_CAPACITY.scaled(main),
        remaining_ah,
        remaining_kwh: voltage * remaining_ah / 1000.0,
        max_voltage: alternate::ASSUMED_MAX_VOLTAGE,
        max_current: alternate::ASSUMED_MAX_CURRENT,
        cell_count: installed.len() as u16,
        cell_voltages: installed,
        cell_min,
        cell_max,
    }
}
