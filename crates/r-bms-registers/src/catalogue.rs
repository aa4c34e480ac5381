//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "BMS and ESC register ids, lengths and names, with set resolution from config."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::{CatalogueError, Result};

/// Bus address answered by the BMS.
pub const BMS_ADDRESS: u16 = 0x0116;
/// Bus address used by the ESC for its status broadcasts.
pub const ESC_ADDRESS: u16 = 0x0183;

/// Identifies a register and its fixed wire length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Register id on the wire.
    pub id: u8,
    /// Payload length in bytes.
    pub length: u8,
}

impl ParameterDefinition {
    /// Build a definition from its raw parts.
    pub const fn new(id: u8, length: u8) -> Self {
        Self { id, length }
    }
}

/// Registers served by the BMS at [`BMS_ADDRESS`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum BmsParameter {
    #[strum(serialize = "unknown7")]
    #[serde(rename = "unknown7")]
    Unknown7 = 7,
    Temperatures = 8,
    BatteryVoltage = 9,
    BatteryCurrent = 10,
    BatteryPercent = 13,
    BatteryHealth = 14,
    RemainingCapacity = 15,
    TotalCapacity = 16,
    Statistics = 21,
    BmsStatus = 22,
    ChargeCycles = 23,
    DesignedCapacity = 24,
    DesignedVoltage = 25,
    Versions = 26,
    ManufacturingDate = 27,
    RtcTime = 29,
    BmsManufacturer = 32,
    BatteryModel = 33,
    CellType = 34,
    SerialNumber = 35,
    #[strum(serialize = "cell_voltages1")]
    #[serde(rename = "cell_voltages1")]
    CellVoltages1 = 36,
    #[strum(serialize = "cell_voltages2")]
    #[serde(rename = "cell_voltages2")]
    CellVoltages2 = 37,
    History = 38,
}

impl BmsParameter {
    /// Register id on the wire.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Fixed payload length of the register.
    pub const fn length(self) -> u8 {
        match self {
            Self::Unknown7 | Self::BatteryPercent => 1,
            Self::ManufacturingDate => 3,
            Self::BatteryVoltage
            | Self::BatteryCurrent
            | Self::BatteryHealth
            | Self::RemainingCapacity
            | Self::TotalCapacity
            | Self::ChargeCycles
            | Self::DesignedCapacity
            | Self::DesignedVoltage => 4,
            Self::RtcTime => 6,
            Self::Temperatures | Self::Versions => 8,
            Self::BmsStatus => 10,
            Self::Statistics => 12,
            Self::History => 14,
            Self::BmsManufacturer | Self::CellType => 16,
            Self::BatteryModel | Self::SerialNumber | Self::CellVoltages1 | Self::CellVoltages2 => {
                32
            }
        }
    }

    /// Definition used by the driver and the caches.
    pub const fn definition(self) -> ParameterDefinition {
        ParameterDefinition::new(self.id(), self.length())
    }

    /// Look up a register by wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::iter().find(|parameter| parameter.id() == id)
    }
}

/// Status registers broadcast by the ESC at [`ESC_ADDRESS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum EscParameter {
    #[strum(serialize = "status72")]
    Status72 = 72,
    #[strum(serialize = "status75")]
    Status75 = 75,
}

impl EscParameter {
    /// Register id on the wire.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Length of the register value.
    pub const fn length(self) -> u8 {
        match self {
            Self::Status72 => 12,
            Self::Status75 => 2,
        }
    }

    /// Look up a register by wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::iter().find(|parameter| parameter.id() == id)
    }
}

/// Resolve configured register names into definitions, preserving order.
pub fn resolve_bms_parameters<S: AsRef<str>>(names: &[S]) -> Result<Vec<ParameterDefinition>> {
    let mut seen = BTreeSet::new();
    names
        .iter()
        .map(|name| {
            let name = name.as_ref();
            let parameter = BmsParameter::from_str(name.trim())
                .map_err(|_| CatalogueError::UnknownParameter(name.to_owned()))?;
            if !seen.insert(parameter.id()) {
                return Err(CatalogueError::DuplicateParameter(name.to_owned()));
            }
            Ok(parameter.definition())
        })
        .collect()
}

/// Human readable name for a register id seen on the given address.
pub fn describe(address: u16, id: u8) -> String {
    let known = match address {
        BMS_ADDRESS => BmsParameter::from_id(id).map(|p| p.as_ref().to_owned()),
        ESC_ADDRESS => EscParameter::from_id(id).map(|p| p.as_ref().to_owned()),
        _ => None,
    };
    known.unwrap_or_else(|| format!("param_{id}"))
}
