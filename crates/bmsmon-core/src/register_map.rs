//! ---
//! ems_section: "02-decode-pipeline"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Static holding-register layouts per protocol variant."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Register layouts for the supported battery protocols.
//!
//! Each layout is a `'static` table shared by every session speaking that
//! protocol. The decoder references the per-protocol constants directly since
//! the variants differ in which fields exist, not only in their offsets.

use bmsmon_common::Protocol;

/// Offset of a field within its register block and the divisor turning the
/// raw word into engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterField {
    pub offset: u16,
    pub divisor: f64,
}

impl RegisterField {
    pub const fn new(offset: u16, divisor: f64) -> Self {
        Self { offset, divisor }
    }

    /// Raw word for this field. Callers check the block length first.
    pub fn raw(&self, block: &[u16]) -> u16 {
        block[self.offset as usize]
    }

    pub fn scaled(&self, block: &[u16]) -> f64 {
        f64::from(self.raw(block)) / self.divisor
    }
}

/// Where the per-cell voltage words live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellLayout {
    /// Separate read starting at this register.
    Block { start: u16 },
    /// Slice of the main block starting at this offset.
    Embedded { offset: u16 },
}

impl CellLayout {
    pub fn start(&self) -> u16 {
        match self {
            CellLayout::Block { start } => *start,
            CellLayout::Embedded { offset } => *offset,
        }
    }
}

/// Immutable description of one protocol's register layout.
#[derive(Debug)]
pub struct RegisterMap {
    pub protocol: Protocol,
    /// Words read from register 0 on every poll.
    pub main_block_len: u16,
    pub cell_layout: CellLayout,
    pub cell_voltage_count: u16,
    pub cell_divisor: f64,
    fields: &'static [(&'static str, RegisterField)],
}

impl RegisterMap {
    pub fn for_protocol(protocol: Protocol) -> &'static RegisterMap {
        match protocol {
            Protocol::Standard => &standard::MAP,
            Protocol::Alternate => &alternate::MAP,
        }
    }

    /// Look up a field by its semantic name.
    pub fn field(&self, name: &str) -> Option<RegisterField> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, register)| *register)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, RegisterField)> + '_ {
        self.fields.iter().copied()
    }

    pub fn cell_voltage_start(&self) -> u16 {
        self.cell_layout.start()
    }
}

/// Layout with a trailing cell block (EG4 WallMount family).
pub mod standard {
    use super::{CellLayout, RegisterField, RegisterMap};
    use bmsmon_common::Protocol;

    pub const SOC: RegisterField = RegisterField::new(19, 1.0);
    pub const SOH: RegisterField = RegisterField::new(21, 1.0);
    pub const VOLTAGE: RegisterField = RegisterField::new(22, 100.0);
    pub const CURRENT: RegisterField = RegisterField::new(24, 100.0);
    pub const REMAINING_KWH: RegisterField = RegisterField::new(25, 100.0);
    pub const DESIGN_CAPACITY: RegisterField = RegisterField::new(26, 100.0);
    pub const FULL_CAPACITY: RegisterField = RegisterField::new(27, 100.0);
    pub const REMAINING_AH: RegisterField = RegisterField::new(28, 10.0);
    pub const TEMPERATURE: RegisterField = RegisterField::new(30, 10.0);
    pub const MAX_VOLTAGE: RegisterField = RegisterField::new(33, 100.0);
    pub const MAX_CURRENT: RegisterField = RegisterField::new(35, 100.0);
    pub const CYCLE_COUNT: RegisterField = RegisterField::new(39, 1.0);
    pub const STATUS: RegisterField = RegisterField::new(40, 1.0);
    pub const CELL_COUNT: RegisterField = RegisterField::new(41, 1.0);

    pub const CELL_VOLTAGE_START: u16 = 113;
    pub const CELL_VOLTAGE_COUNT: u16 = 16;
    pub const MAIN_BLOCK_LEN: u16 = 60;

    pub static MAP: RegisterMap = RegisterMap {
        protocol: Protocol::Standard,
        main_block_len: MAIN_BLOCK_LEN,
        cell_layout: CellLayout::Block {
            start: CELL_VOLTAGE_START,
        },
        cell_voltage_count: CELL_VOLTAGE_COUNT,
        cell_divisor: 1000.0,
        fields: &[
            ("soc", SOC),
            ("soh", SOH),
            ("voltage", VOLTAGE),
            ("current", CURRENT),
            ("remaining_kwh", REMAINING_KWH),
            ("design_capacity", DESIGN_CAPACITY),
            ("full_capacity", FULL_CAPACITY),
            ("remaining_ah", REMAINING_AH),
            ("temperature", TEMPERATURE),
            ("max_voltage", MAX_VOLTAGE),
            ("max_current", MAX_CURRENT),
            ("cycle_count", CYCLE_COUNT),
            ("status", STATUS),
            ("cell_count", CELL_COUNT),
        ],
    };
}

/// Compact layout with cells and temperature probes inside the main block
/// (PACE-style BMS boards).
pub mod alternate {
    use super::{CellLayout, RegisterField, RegisterMap};
    use bmsmon_common::Protocol;

    pub const CURRENT: RegisterField = RegisterField::new(0, 100.0);
    pub const VOLTAGE: RegisterField = RegisterField::new(1, 100.0);
    pub const SOC: RegisterField = RegisterField::new(2, 1.0);
    pub const SOH: RegisterField = RegisterField::new(3, 1.0);
    pub const REMAINING_AH: RegisterField = RegisterField::new(4, 10.0);
    pub const FULL_CAPACITY: RegisterField = RegisterField::new(5, 100.0);
    pub const DESIGN_CAPACITY: RegisterField = RegisterField::new(6, 100.0);
    pub const TEMPERATURE_SENSORS: [RegisterField; 5] = [
        RegisterField::new(31, 10.0),
        RegisterField::new(32, 10.0),
        RegisterField::new(33, 10.0),
        RegisterField::new(34, 10.0),
        RegisterField::new(35, 10.0),
    ];

    pub const CELL_VOLTAGE_START: u16 = 15;
    pub const CELL_VOLTAGE_COUNT: u16 = 16;
    pub const MAIN_BLOCK_LEN: u16 = 40;

    /// Raw cell word reported for an unpopulated cell slot.
    pub const CELL_NOT_INSTALLED: u16 = 0xFFFF;
    /// Raw temperature words at or above this value mean "no probe".
    pub const TEMPERATURE_ABSENT_FROM: u16 = 1000;
    /// Plausible cell range in volts; readings outside are ignored.
    pub const CELL_VALID_RANGE: (f64, f64) = (2.0, 4.5);

    /// Not exposed by this layout. Typical for a 16-series LiFePO4 pack.
    pub const ASSUMED_MAX_VOLTAGE: f64 = 58.4;
    pub const ASSUMED_MAX_CURRENT: f64 = 200.0;

    pub static MAP: RegisterMap = RegisterMap {
        protocol: Protocol::Alternate,
        main_block_len: MAIN_BLOCK_LEN,
        cell_layout: CellLayout::Embedded {
            offset: CELL_VOLTAGE_START,
        },
        cell_voltage_count: CELL_VOLTAGE_COUNT,
        cell_divisor: 1000.0,
        fields: &[
            ("current", CURRENT),
            ("voltage", VOLTAGE),
            ("soc", SOC),
            ("soh", SOH),
            ("remaining_ah", REMAINING_AH),
            ("full_capacity", FULL_CAPACITY),
            ("design_capacity", DESIGN_CAPACITY),
            ("temperature_1", TEMPERATURE_SENSORS[0]),
            ("temperature_2", TEMPERATURE_SENSORS[1]),
            ("temperature_3", TEMPERATURE_SENSORS[2]),
            ("temperature_4", TEMPERATURE_SENSORS[3]),
            ("temperature_5", TEMPERATURE_SENSORS[4]),
        ],
    };
}
