use byteorder::{LE, WriteBytesExt};
use hidapi::{HidDevice, HidError};
use log::trace;
use std::io::Write;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Size of every page written to, and every report read from, the dock EC.
pub const PAGE_SIZE: usize = 192;

// The EC fetches query responses from the sub-device it fronts, which takes a while.
const QUERY_DELAY: Duration = Duration::from_millis(800);

// cmd + ext + register + length + parameters + reserved + data
const CMD_BUFFER_SIZE: usize = 1 + 1 + 4 + 2 + 3 + 53 + PAGE_SIZE;
const CMD_DATA_OFFSET: usize = CMD_BUFFER_SIZE - PAGE_SIZE;
const I2C_PARAMETERS: [u8; 3] = [0xec, 0x01, 0x80]; // address, length, speed

/// Host commands understood by the dock EC. Stable across all firmware versions.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EcCommand {
    SetDockPkg = 0x01,
    GetDockInfo = 0x02,
    GetDockData = 0x03,
    GetDockType = 0x05,
    SetModifyLock = 0x0a,
    SetFwupMode = 0x0b,
    SetPassive = 0x0d,
}

#[repr(u8)]
enum HidCmd {
    ExtI2cWrite = 0xc6,
    ExtI2cRead = 0xd6,
}

/// A blocking, strictly sequential request/response channel to the dock EC. Implemented for
/// [HidDevice]; tests substitute a recording fake.
pub trait Transport {
    /// Run a read command and return the dock's response. On success the response is `len` bytes
    /// long unless the dock sent back a short report.
    fn query(&self, command: EcCommand, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Send a write command. `data` starts with the command byte.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Write one page of a framed firmware chunk.
    fn write_page(&self, page: &[u8; PAGE_SIZE]) -> Result<(), TransportError>;

    /// Read one fixed-size report from the dock.
    fn read_report(&self) -> Result<[u8; PAGE_SIZE], TransportError>;

    /// Block for the given duration. The dock needs time to flash what it has been sent.
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            sleep(duration);
        }
    }
}

/// Failures of a single transport round trip. Timeouts are enforced by the OS and reported like any
/// other I/O failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("dock does not recognize the command")]
    NotFound,

    #[error("HID error")]
    Hid(#[source] HidError),

    #[error("dock returned an empty report")]
    NoReport,

    #[error("report from dock was {actual} bytes, expected {expected}")]
    ReportTooShort { expected: usize, actual: usize },

    #[error("request of {0} bytes does not fit in a HID command buffer")]
    RequestTooLarge(usize),
}

impl From<HidError> for TransportError {
    fn from(e: HidError) -> Self {
        match e {
            HidError::IoError { error } if error.kind() == std::io::ErrorKind::NotFound => {
                TransportError::NotFound
            }
            e => TransportError::Hid(e),
        }
    }
}

impl Transport for HidDevice {
    fn query(&self, command: EcCommand, len: usize) -> Result<Vec<u8>, TransportError> {
        let request = command_buffer(HidCmd::ExtI2cRead, command as u32, len, &[])?;
        write_report(self, &request)?;

        sleep(QUERY_DELAY);

        let mut response = read_raw(self)?;
        trace!("Raw response to {command:?}: {response:02x?}");

        response.truncate(len);
        Ok(response)
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let request = command_buffer(HidCmd::ExtI2cWrite, 0, data.len(), data)?;
        write_report(self, &request)
    }

    fn write_page(&self, page: &[u8; PAGE_SIZE]) -> Result<(), TransportError> {
        let mut report = [0u8; 1 + PAGE_SIZE]; // 1 byte report ID + page
        report[1..].copy_from_slice(page);
        write_report(self, &report)
    }

    fn read_report(&self) -> Result<[u8; PAGE_SIZE], TransportError> {
        let response = read_raw(self)?;
        response
            .as_slice()
            .try_into()
            .map_err(|_| TransportError::ReportTooShort {
                expected: PAGE_SIZE,
                actual: response.len(),
            })
    }
}

/// Build an output report (report ID 0) carrying an I2C command for the EC.
fn command_buffer(
    cmd: HidCmd,
    register: u32,
    length: usize,
    data: &[u8],
) -> Result<[u8; 1 + CMD_BUFFER_SIZE], TransportError> {
    if length > PAGE_SIZE || data.len() > PAGE_SIZE {
        return Err(TransportError::RequestTooLarge(length.max(data.len())));
    }

    let mut report = [0u8; 1 + CMD_BUFFER_SIZE];
    let mut cursor = std::io::Cursor::new(&mut report[..]);
    cursor.write_u8(0).unwrap(); // Report ID
    cursor.write_u8(cmd as u8).unwrap();
    cursor.write_u8(0).unwrap(); // ext
    cursor.write_u32::<LE>(register).unwrap();
    cursor.write_u16::<LE>(length as u16).unwrap();
    cursor.write_all(&I2C_PARAMETERS).unwrap();

    let data_start = 1 + CMD_DATA_OFFSET;
    report[data_start..data_start + data.len()].copy_from_slice(data);
    Ok(report)
}

fn write_report(device: &HidDevice, report: &[u8]) -> Result<(), TransportError> {
    trace!("Writing {} byte report", report.len());
    device.write(report)?;
    Ok(())
}

/// Fetch the dock's current input report with a GET_REPORT request. Anything the dock pushed to
/// the interrupt endpoint earlier is never mistaken for the answer.
fn read_raw(device: &HidDevice) -> Result<Vec<u8>, TransportError> {
    let mut report = [0u8; 1 + PAGE_SIZE];
    report[0] = 0; // Report ID
    let size = device.get_input_report(&mut report)?;
    strip_report_id(&report, size).map(<[u8]>::to_vec)
}

/// The payload of a report read into `report`, of which `size` bytes (report ID included) were
/// filled in.
fn strip_report_id(report: &[u8], size: usize) -> Result<&[u8], TransportError> {
    match size {
        0 => Err(TransportError::NoReport),
        1 => Err(TransportError::ReportTooShort {
            expected: PAGE_SIZE,
            actual: 0,
        }),
        n => Ok(&report[1..n.min(report.len())]),
    }
}
