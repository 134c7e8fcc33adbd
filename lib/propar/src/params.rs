//! The static parameter database mapping DDE numbers to their wire location
//! and type. Only the parameters the runtime actually touches are carried;
//! the table grows as new operations need new parameters.

use crate::message::Parameter;
use crate::value::ParameterType;
use hashbrown::HashMap;
use lazy_static::lazy_static;

/// Well known DDE numbers, named for use at call sites.
pub mod dde {
    pub const MEASURE: u16 = 8;
    pub const SETPOINT: u16 = 9;
    pub const SETPOINT_SLOPE: u16 = 10;
    pub const CONTROL_MODE: u16 = 12;
    pub const CAPACITY: u16 = 21;
    pub const FLUID_INDEX: u16 = 24;
    pub const FLUID_NAME: u16 = 25;
    pub const DEVICE_TYPE: u16 = 90;
    pub const MODEL_NUMBER: u16 = 91;
    pub const SERIAL_NUMBER: u16 = 92;
    pub const USER_TAG: u16 = 115;
    pub const CAPACITY_UNIT: u16 = 129;
    pub const IDENT_NUMBER: u16 = 175;
    pub const FMEASURE: u16 = 205;
    pub const FSETPOINT: u16 = 206;
}

/// One entry of the parameter database.
#[derive(Debug, Copy, Clone)]
pub struct ParamInfo {
    pub dde: u16,
    pub name: &'static str,
    pub proc_nr: u8,
    pub parm_nr: u8,
    pub parm_type: ParameterType,
}

impl ParamInfo {
    /// Descriptor for this parameter, node not yet assigned.
    #[inline]
    pub fn parameter(&self) -> Parameter {
        Parameter::new(self.proc_nr, self.parm_nr, self.parm_type)
    }
}

macro_rules! param_table {
    ($(($dde:expr, $name:expr, $proc:expr, $parm:expr, $type:ident)),* $(,)?) => {
        &[$(ParamInfo {
            dde: $dde,
            name: $name,
            proc_nr: $proc,
            parm_nr: $parm,
            parm_type: ParameterType::$type,
        }),*]
    };
}

static ENTRIES: &[ParamInfo] = param_table![
    (8, "measure", 1, 0, Int16),
    (9, "setpoint", 1, 1, Int16),
    (10, "setpoint slope", 1, 2, Int16),
    (12, "control mode", 1, 4, Int8),
    (21, "capacity 100%", 1, 13, Float),
    (24, "fluidset index", 1, 16, Int8),
    (25, "fluidset name", 1, 17, String),
    (90, "device type", 113, 1, String),
    (91, "model number", 113, 2, String),
    (92, "serial number", 113, 3, String),
    (115, "user tag", 113, 6, String),
    (129, "capacity unit", 1, 31, String),
    (175, "ident number", 113, 12, Int8),
    (205, "fmeasure", 33, 0, Float),
    (206, "fsetpoint", 33, 3, Float),
];

lazy_static! {
    static ref BY_DDE: HashMap<u16, &'static ParamInfo> =
        ENTRIES.iter().map(|info| (info.dde, info)).collect();
}

/// Look up a parameter by its DDE number.
#[inline]
pub fn lookup(dde: u16) -> Option<&'static ParamInfo> {
    BY_DDE.get(&dde).copied()
}
