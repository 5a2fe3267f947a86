use crate::protocol::ProtocolError;
use byteorder::{BE, LE, ReadBytesExt, WriteBytesExt};
use num_enum::TryFromPrimitive;
use std::io::{Cursor, Read, Write};

/// Size of a dock data response on the wire.
pub const DOCK_DATA_SIZE: usize = 191;

/// Size of the firmware package record accepted by [SetDockPkg](crate::transport::EcCommand).
pub const PACKAGE_SIZE: usize = 16 * 4;

const SERVICE_TAG_LEN: usize = 7;
const MARKETING_NAME_LEN: usize = 32;
const DOCK_DATA_TAIL_RESERVED: usize = 103;

/// Bit in [DockData::dock_status] set while the dock has a firmware update staged.
pub const DOCK_STATUS_UPDATE_PENDING: u32 = 1 << 8;

/// Modules that can be attached to the dock base.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum ModuleType {
    NoModule = 0x00,
    Watt130Dp = 0x04,
    Watt130Universal = 0x05,
    Watt210DualC = 0x07,
    Watt130Tbt4 = 0x08,
    QiCharger = 0xa0,
    WifiRmm = 0xa1,
    Unknown = 0xfe,
}

/// Identity and status of the dock, as returned by the dock data command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DockData {
    pub dock_configuration: u8,
    pub dock_type: u8,
    pub power_supply_wattage: u16,
    pub module_type: u16,
    pub board_id: u16,
    pub port0_dock_status: u16,
    pub port1_dock_status: u16,
    pub package_version: u32,
    pub module_serial: u64,
    pub original_module_serial: u64,
    pub service_tag: String,
    pub marketing_name: String,
    pub dock_error: u32,
    pub module_status: u32,
    pub module_error: u32,
    pub dock_status: u32,
}

impl DockData {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_size("dock data", DOCK_DATA_SIZE, buf.len())?;

        // Size was checked above, so none of these reads can run out of data.
        let mut cursor = Cursor::new(buf);
        let dock_configuration = cursor.read_u8().unwrap();
        let dock_type = cursor.read_u8().unwrap();
        let power_supply_wattage = cursor.read_u16::<LE>().unwrap();
        let module_type = cursor.read_u16::<LE>().unwrap();
        let board_id = cursor.read_u16::<LE>().unwrap();
        let port0_dock_status = cursor.read_u16::<LE>().unwrap();
        let port1_dock_status = cursor.read_u16::<LE>().unwrap();
        let package_version = cursor.read_u32::<BE>().unwrap();
        let module_serial = cursor.read_u64::<LE>().unwrap();
        let original_module_serial = cursor.read_u64::<LE>().unwrap();
        let service_tag = read_string::<SERVICE_TAG_LEN>(&mut cursor);
        let marketing_name = read_string::<MARKETING_NAME_LEN>(&mut cursor);
        let dock_error = cursor.read_u32::<LE>().unwrap();
        let module_status = cursor.read_u32::<LE>().unwrap();
        let module_error = cursor.read_u32::<LE>().unwrap();
        cursor.read_u8().unwrap(); // reserved
        let dock_status = cursor.read_u32::<LE>().unwrap();
        assert!(cursor.position() as usize == DOCK_DATA_SIZE - DOCK_DATA_TAIL_RESERVED);

        Ok(Self {
            dock_configuration,
            dock_type,
            power_supply_wattage,
            module_type,
            board_id,
            port0_dock_status,
            port1_dock_status,
            package_version,
            module_serial,
            original_module_serial,
            service_tag,
            marketing_name,
            dock_error,
            module_status,
            module_error,
            dock_status,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DOCK_DATA_SIZE);
        buf.write_u8(self.dock_configuration).unwrap();
        buf.write_u8(self.dock_type).unwrap();
        buf.write_u16::<LE>(self.power_supply_wattage).unwrap();
        buf.write_u16::<LE>(self.module_type).unwrap();
        buf.write_u16::<LE>(self.board_id).unwrap();
        buf.write_u16::<LE>(self.port0_dock_status).unwrap();
        buf.write_u16::<LE>(self.port1_dock_status).unwrap();
        buf.write_u32::<BE>(self.package_version).unwrap();
        buf.write_u64::<LE>(self.module_serial).unwrap();
        buf.write_u64::<LE>(self.original_module_serial).unwrap();
        write_string::<SERVICE_TAG_LEN>(&mut buf, &self.service_tag);
        write_string::<MARKETING_NAME_LEN>(&mut buf, &self.marketing_name);
        buf.write_u32::<LE>(self.dock_error).unwrap();
        buf.write_u32::<LE>(self.module_status).unwrap();
        buf.write_u32::<LE>(self.module_error).unwrap();
        buf.write_u8(0).unwrap(); // reserved
        buf.write_u32::<LE>(self.dock_status).unwrap();
        buf.resize(DOCK_DATA_SIZE, 0);
        buf
    }

    /// Serial number in the form `<service tag>/<module serial>`.
    pub fn serial(&self) -> String {
        format!("{:.7}/{:016}", self.service_tag, self.module_serial)
    }

    pub fn module(&self) -> Option<ModuleType> {
        ModuleType::try_from(self.module_type).ok()
    }

    pub fn is_update_pending(&self) -> bool {
        self.dock_status & DOCK_STATUS_UPDATE_PENDING != 0
    }
}

/// Component versions making up a firmware package. Committed to the dock after all of the
/// package's components have been written, so it can report what is installed.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PackageVersions {
    pub ec: u32,
    pub mst: u32,
    pub hub1: u32,
    pub hub2: u32,
    pub tbt: u32,
    pub package: u32,
    pub pd: u32,
    pub epr: u32,
    pub dpmux: u32,
    pub rmm: u32,
}

impl PackageVersions {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != PACKAGE_SIZE {
            return Err(ProtocolError::InvalidData {
                expected: PACKAGE_SIZE,
                actual: buf.len(),
            });
        }

        let mut v = [0u32; 10];
        let mut cursor = Cursor::new(buf);
        cursor.read_u32_into::<LE>(&mut v).unwrap();
        let [ec, mst, hub1, hub2, tbt, package, pd, epr, dpmux, rmm] = v;

        Ok(Self {
            ec,
            mst,
            hub1,
            hub2,
            tbt,
            package,
            pd,
            epr,
            dpmux,
            rmm,
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKAGE_SIZE] {
        let mut buf = [0u8; PACKAGE_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        for v in [
            self.ec,
            self.mst,
            self.hub1,
            self.hub2,
            self.tbt,
            self.package,
            self.pd,
            self.epr,
            self.dpmux,
            self.rmm,
        ] {
            cursor.write_u32::<LE>(v).unwrap();
        }
        buf
    }
}

fn ensure_size(record: &'static str, expected: usize, actual: usize) -> Result<(), ProtocolError> {
    if actual != expected {
        Err(ProtocolError::MalformedRecord {
            record,
            expected,
            actual,
        })
    } else {
        Ok(())
    }
}

/// Read a fixed-width, NUL-padded string field. Erased fields read back as `0xff` bytes, so
/// anything that isn't UTF-8 is replaced rather than rejected.
fn read_string<const N: usize>(cursor: &mut Cursor<&[u8]>) -> String {
    let mut field = [0u8; N];
    cursor.read_exact(&mut field).unwrap();

    let value = field.split(|&x| x == 0).next().unwrap();
    String::from_utf8_lossy(value).into_owned()
}

fn write_string<const N: usize>(buf: &mut Vec<u8>, value: &str) {
    let mut field = [0u8; N];
    let len = value.len().min(N);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
    buf.write_all(&field).unwrap();
}
