use crate::directory::{DeviceDirectory, DeviceType, subtype};
use crate::protocol::ProtocolError;
use num_enum::TryFromPrimitive;
use std::fmt::Display;

const DELL_VID: u16 = 0x413c;

/// USB IDs of the HID interface exposed by the dock's embedded controller.
const DOCK_EC_IDS: &[UsbId] = &[UsbId {
    vid: DELL_VID,
    pid: 0xb06e,
}];

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Whether a HID interface with the given USB ID is a dock EC we can talk to. This only says the
/// interface speaks the protocol; whether the dock behind it is supported is decided by
/// [resolve_base_type] once it has been queried.
pub fn identify_device(id: UsbId) -> bool {
    DOCK_EC_IDS.contains(&id)
}

/// Dock families, as reported by the dock type command.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum BaseType {
    K2 = 0x07,
}

impl Display for BaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BaseType::K2 => write!(f, "K2"),
        }
    }
}

/// Product variant of a dock, told apart by the Thunderbolt controller it carries.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DockSku {
    DisplayPortAlt = 0x01,
    Tbt4 = 0x02,
    Tbt5 = 0x03,
}

impl Display for DockSku {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DockSku::DisplayPortAlt => write!(f, "DisplayPort alt-mode"),
            DockSku::Tbt4 => write!(f, "Thunderbolt 4"),
            DockSku::Tbt5 => write!(f, "Thunderbolt 5"),
        }
    }
}

/// What kind of dock we are talking to. Derived from a [DeviceDirectory], never sent by the dock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Classification {
    pub base_type: BaseType,
    pub sku: DockSku,
}

/// Map a dock type code to a supported family. Anything else is not our device.
pub fn resolve_base_type(code: u8) -> Result<BaseType, ProtocolError> {
    BaseType::try_from(code).map_err(|e| ProtocolError::UnsupportedDock(e.number))
}

/// Classify a dock from its type code and the devices it reports.
pub fn classify(base_type: u8, directory: &DeviceDirectory) -> Result<Classification, ProtocolError> {
    if directory.is_empty() {
        return Err(ProtocolError::NoDevices);
    }

    let base_type = resolve_base_type(base_type)?;
    let sku = match base_type {
        BaseType::K2 => {
            let has_tbt = |sub_type| directory.find(DeviceType::Tbt, sub_type, 0).is_some();

            if has_tbt(subtype::TBT_BARLOW_RIDGE) {
                DockSku::Tbt5
            } else if has_tbt(subtype::TBT_GOSHEN_RIDGE) {
                DockSku::Tbt4
            } else {
                DockSku::DisplayPortAlt
            }
        }
    };

    Ok(Classification { base_type, sku })
}
