use crate::protocol::ProtocolError;
use byteorder::{BE, ByteOrder};
use log::{debug, info, warn};
use num_enum::TryFromPrimitive;
use std::fmt::Display;

/// Maximum number of entries the dock reports.
pub const MAX_DEVICES: usize = 20;

const HEADER_SIZE: usize = 3;
const ENTRY_SIZE: usize = 9;

/// Size of a dock info response on the wire.
pub const DOCK_INFO_SIZE: usize = HEADER_SIZE + MAX_DEVICES * ENTRY_SIZE;

/// Kinds of sub-device a dock can host.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum DeviceType {
    MainEc = 0,
    Pd = 1,
    UsbHub = 2,
    Mst = 3,
    Tbt = 4,
    Qi = 5,
    DpMux = 6,
    Lan = 7,
    Fan = 8,
    Rmm = 9,
    Wtpd = 10,
}

/// Where in the dock a sub-device lives.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum Location {
    Base = 0,
    Module = 1,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Location::Base => write!(f, "Base"),
            Location::Module => write!(f, "Module"),
        }
    }
}

/// Known values for [DeviceEntry::sub_type] and [DeviceEntry::instance]. A sub-type of 0 doubles
/// as the wildcard in [DeviceDirectory::find].
pub mod subtype {
    pub const USBHUB_RTS5480: u8 = 0;
    pub const USBHUB_RTS5485: u8 = 1;

    pub const MST_VMM8430: u8 = 0;
    pub const MST_VMM9430: u8 = 1;

    pub const TBT_TITAN_RIDGE: u8 = 0;
    pub const TBT_GOSHEN_RIDGE: u8 = 1;
    pub const TBT_BARLOW_RIDGE: u8 = 2;

    pub const PD_TI: u8 = 0;

    pub const PD_TI_INSTANCE_UP5: u8 = 0;
    pub const PD_TI_INSTANCE_UP15: u8 = 1;
    pub const PD_TI_INSTANCE_UP17: u8 = 2;
}

/// One sub-device as reported by the dock. Type codes are kept raw since newer docks may report
/// types this crate doesn't know about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceEntry {
    pub location: u8,
    pub device_type: u8,
    pub sub_type: u8,
    pub arg: u8,
    pub instance: u8,
    pub version_bytes: [u8; 4],
}

impl DeviceEntry {
    pub fn new(device_type: DeviceType, sub_type: u8, instance: u8, version: u32) -> Self {
        Self {
            location: Location::Base as u8,
            device_type: device_type as u8,
            sub_type,
            arg: 0,
            instance,
            version_bytes: version.to_be_bytes(),
        }
    }

    /// Firmware version; the dock sends it big-endian.
    pub fn version(&self) -> u32 {
        BE::read_u32(&self.version_bytes)
    }

    pub fn location(&self) -> Location {
        Location::try_from(self.location).unwrap_or(Location::Module)
    }

    pub fn name(&self) -> Option<&'static str> {
        device_name(self.device_type, self.sub_type, self.instance)
    }
}

/// The dock's table of attached sub-devices. Only the first `total_devices` entries are kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceDirectory {
    pub first_index: u8,
    pub last_index: u8,
    entries: Vec<DeviceEntry>,
}

impl DeviceDirectory {
    /// Build a directory from `entries`. The dock has room for [MAX_DEVICES] of them; any past
    /// that are dropped.
    pub fn new(mut entries: Vec<DeviceEntry>) -> Self {
        entries.truncate(MAX_DEVICES);
        Self {
            first_index: 0,
            last_index: entries.len().saturating_sub(1) as u8,
            entries,
        }
    }

    /// Decode a dock info response, which must be exactly [DOCK_INFO_SIZE] bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != DOCK_INFO_SIZE {
            return Err(ProtocolError::MalformedRecord {
                record: "dock info",
                expected: DOCK_INFO_SIZE,
                actual: buf.len(),
            });
        }

        let total_devices = buf[0];
        if total_devices as usize > MAX_DEVICES {
            return Err(ProtocolError::InvalidDeviceCount(total_devices));
        }

        let entries = buf[HEADER_SIZE..]
            .chunks_exact(ENTRY_SIZE)
            .take(total_devices as usize)
            .map(|e| DeviceEntry {
                location: e[0],
                device_type: e[1],
                sub_type: e[2],
                arg: e[3],
                instance: e[4],
                version_bytes: [e[5], e[6], e[7], e[8]],
            })
            .collect();

        Ok(Self {
            first_index: buf[1],
            last_index: buf[2],
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DOCK_INFO_SIZE];
        buf[0] = self.entries.len() as u8;
        buf[1] = self.first_index;
        buf[2] = self.last_index;

        for (dst, e) in buf[HEADER_SIZE..]
            .chunks_exact_mut(ENTRY_SIZE)
            .zip(&self.entries)
        {
            dst[..5].copy_from_slice(&[e.location, e.device_type, e.sub_type, e.arg, e.instance]);
            dst[5..].copy_from_slice(&e.version_bytes);
        }
        buf
    }

    pub fn total_devices(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    /// Find the first entry of the given type. A `sub_type` of 0 matches any sub-type, and
    /// `instance` is only compared for PD controllers, which share a type across ports.
    pub fn find(&self, device_type: DeviceType, sub_type: u8, instance: u8) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| {
            e.device_type == device_type as u8
                && (sub_type == 0 || e.sub_type == sub_type)
                && (device_type != DeviceType::Pd || e.instance == instance)
        })
    }

    /// Log the directory contents, naming each entry we know about.
    pub fn log_contents(&self) {
        info!(
            "Found {} devices [{}->{}]",
            self.total_devices(),
            self.first_index,
            self.last_index
        );

        for (i, entry) in self.entries.iter().enumerate() {
            let Some(name) = entry.name() else {
                warn!(
                    "Missing device name, DevType: {}, SubType: {}, Inst: {}",
                    entry.device_type, entry.sub_type, entry.instance
                );
                continue;
            };

            debug!(
                "#{i}: {name} located in {} (A: {} I: {}), version {}",
                entry.location(),
                entry.arg,
                entry.instance,
                format_version(entry.version())
            );
        }
    }
}

/// Human-readable name of a sub-device, if we know it.
pub fn device_name(device_type: u8, sub_type: u8, instance: u8) -> Option<&'static str> {
    use DeviceType::*;
    use subtype::*;

    let name = match DeviceType::try_from(device_type).ok()? {
        MainEc => "EC",
        Pd => match (sub_type, instance) {
            (PD_TI, PD_TI_INSTANCE_UP5) => "PD UP5",
            (PD_TI, PD_TI_INSTANCE_UP15) => "PD UP15",
            (PD_TI, PD_TI_INSTANCE_UP17) => "PD UP17",
            _ => return None,
        },
        UsbHub => match sub_type {
            USBHUB_RTS5480 => "RTS5480 USB Hub",
            USBHUB_RTS5485 => "RTS5485 USB Hub",
            _ => return None,
        },
        Mst => match sub_type {
            MST_VMM8430 => "MST VMM8430",
            MST_VMM9430 => "MST VMM9430",
            _ => return None,
        },
        Tbt => match sub_type {
            TBT_TITAN_RIDGE => "Titan Ridge",
            TBT_GOSHEN_RIDGE => "Goshen Ridge",
            TBT_BARLOW_RIDGE => "Barlow Ridge",
            _ => return None,
        },
        Qi => "Qi",
        DpMux => "DP Mux",
        Lan => "Intel i226-LM",
        Fan => "Fan",
        Rmm => "Remote Management",
        Wtpd => "Weltrend PD",
    };
    Some(name)
}

/// Format a version as four hex bytes, most significant first.
pub fn format_version(version: u32) -> String {
    let [a, b, c, d] = version.to_be_bytes();
    format!("{a:02x}.{b:02x}.{c:02x}.{d:02x}")
}
