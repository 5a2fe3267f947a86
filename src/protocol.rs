use crate::directory::{DOCK_INFO_SIZE, DeviceDirectory, DeviceType, format_version, subtype};
use crate::identity::{self, BaseType, Classification, DockSku};
use crate::retry::{RetryError, RetryPolicy, retry};
use crate::transfer;
use crate::transport::{EcCommand, Transport, TransportError};
use crate::wire::{DOCK_DATA_SIZE, DockData, PACKAGE_SIZE};
use byteorder::{LE, WriteBytesExt};
use log::{debug, info, trace};
use std::time::Duration;
use thiserror::Error;

// A freshly plugged-in dock takes a while to enumerate everything behind it.
const READY_POLICY: RetryPolicy = RetryPolicy {
    attempts: 10,
    delay: Duration::from_secs(2),
};

const LOCK_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Actions for [EcCommand::SetPassive].
#[repr(u8)]
#[allow(dead_code)] // All actions included for completeness
enum PassiveAction {
    FlashEc = 1,
    RebootDock = 2,
    AuthTbt = 4,
}

/// Everything learned from one successful query of the dock. Always replaced as a whole, so the
/// directory and classification come from the same query.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub data: DockData,
    pub directory: DeviceDirectory,
    pub classification: Classification,
}

/// A separately updatable part of the dock, for the caller to expose as a child device.
#[derive(Clone, Debug, PartialEq)]
pub struct Subcomponent {
    /// [None] for the firmware package pseudo-device, which stands for the dock as a whole.
    pub device_type: Option<DeviceType>,
    pub sub_type: u8,
    pub instance: u8,
    pub name: &'static str,
    pub version: u32,
}

/// A dock, reached through its embedded controller. All operations are blocking round trips and
/// must not be interleaved, which `&mut self` enforces for everything that refreshes state.
pub struct DockEc<T: Transport> {
    transport: T,
    base_type: u8,
    snapshot: Option<Snapshot>,
    locked: bool,
}

impl<T: Transport> DockEc<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            base_type: 0,
            snapshot: None,
            locked: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check that the dock is of a supported family, then wait for it to report its devices.
    /// [ProtocolError::UnsupportedDock] means this is not a dock we handle, not that it is broken.
    pub fn setup(&mut self) -> Result<(), Error> {
        let response = query(
            &self.transport,
            EcCommand::GetDockType,
            1,
            "querying dock type",
        )?;
        let &[code] = response.as_slice() else {
            return Err(ProtocolError::MalformedRecord {
                record: "dock type",
                expected: 1,
                actual: response.len(),
            }
            .into());
        };

        let base_type = identity::resolve_base_type(code)?;
        debug!("Dock type {code:#04x} ({base_type})");
        self.base_type = code;

        self.reload()?;

        info!(
            "Dock EC version {}, SKU {}",
            format_version(self.ec_version()),
            self.sku().map_or("?".into(), |s| s.to_string())
        );
        Ok(())
    }

    /// Query dock data and dock info until the dock reports a consistent set of devices. A dock
    /// still booting reports no devices, so that and short responses are retried; anything else
    /// fails straight away. The cached snapshot is only replaced on success.
    pub fn reload(&mut self) -> Result<(), Error> {
        let transport = &self.transport;
        let base_type = self.base_type;

        let snapshot = retry(
            READY_POLICY,
            |delay| transport.sleep(delay),
            Error::is_retryable,
            |attempt| {
                trace!("Querying dock, attempt {attempt}");
                query_snapshot(transport, base_type)
            },
        )
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => ProtocolError::DeviceNotReady {
                attempts,
                source: Box::new(last),
            }
            .into(),
            RetryError::Fatal(e) => e,
        })?;

        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Fail with [ProtocolError::DockBusy] if the dock already has an update staged. Queries the
    /// dock once and leaves the cached snapshot alone.
    pub fn is_ready_for_update(&self) -> Result<(), Error> {
        let data = query_dock_data(&self.transport)?;
        if data.is_update_pending() {
            return Err(ProtocolError::DockBusy {
                status: data.dock_status,
            }
            .into());
        }
        Ok(())
    }

    /// Ask the dock to mark itself as owned by (or released from) this host. Some dock firmware
    /// lacks the command; that is ignored.
    pub fn set_lock(&mut self, held: bool) -> Result<(), Error> {
        let mut request = vec![EcCommand::SetModifyLock as u8, 2]; // Command, data length
        request
            .write_u16::<LE>(if held { 0xffff } else { 0x0000 })
            .unwrap();

        self.transport.sleep(LOCK_SETTLE_DELAY);
        match self.transport.send(&request) {
            Ok(()) => (),
            Err(TransportError::NotFound) => {
                debug!("Dock does not support the lock command; ignoring")
            }
            Err(e) => {
                return Err(Error::DeviceIoError {
                    source: e,
                    action: if held { "owning dock" } else { "releasing dock" },
                });
            }
        }

        // Also set when the dock had no lock command, so this is what we asked for, not
        // necessarily what the dock did.
        self.locked = held;
        debug!("Dock is {}", if held { "owned" } else { "released" });
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Have the dock apply staged firmware the next time it is unplugged.
    pub fn run_passive_update(&self) -> Result<(), Error> {
        let request = [
            EcCommand::SetPassive as u8,
            1, // Data length
            PassiveAction::RebootDock as u8,
        ];

        info!("Registered passive update for dock");
        self.transport
            .send(&request)
            .map_err(|e| Error::DeviceIoError {
                source: e,
                action: "registering passive update",
            })
    }

    /// Tell the dock which component versions make up the package just installed. `blob` must be
    /// an encoded [PackageVersions](crate::wire::PackageVersions).
    pub fn commit_package(&self, blob: &[u8]) -> Result<(), Error> {
        if blob.len() != PACKAGE_SIZE {
            return Err(ProtocolError::InvalidData {
                expected: PACKAGE_SIZE,
                actual: blob.len(),
            }
            .into());
        }

        let mut request = Vec::with_capacity(2 + PACKAGE_SIZE);
        request.push(EcCommand::SetDockPkg as u8);
        request.push(PACKAGE_SIZE as u8);
        request.extend_from_slice(blob);
        trace!("Package request: {request:02x?}");

        self.transport
            .send(&request)
            .map_err(|e| Error::DeviceIoError {
                source: e,
                action: "committing package",
            })
    }

    /// Write firmware to one of the dock's components. See [transfer::write_firmware].
    pub fn write_firmware(
        &self,
        payload: &[u8],
        device_type: DeviceType,
        identifier: u8,
    ) -> Result<(), Error> {
        transfer::write_firmware(&self.transport, payload, device_type, identifier)
    }

    /// The components a caller should expose besides the EC itself. Always starts with the
    /// package pseudo-device; the rest depend on what the dock reported.
    pub fn probe_subcomponents(&self) -> Result<Vec<Subcomponent>, ProtocolError> {
        use subtype::*;

        let snapshot = self.snapshot.as_ref().ok_or(ProtocolError::NoDevices)?;
        let directory = &snapshot.directory;

        let mut found = vec![Subcomponent {
            device_type: None,
            sub_type: 0,
            instance: 0,
            name: "Package",
            version: snapshot.data.package_version,
        }];

        let wanted = [
            (DeviceType::Pd, PD_TI, PD_TI_INSTANCE_UP5),
            (DeviceType::Pd, PD_TI, PD_TI_INSTANCE_UP15),
            (DeviceType::Pd, PD_TI, PD_TI_INSTANCE_UP17),
            (DeviceType::DpMux, 0, 0),
            (DeviceType::Wtpd, 0, 0),
            (DeviceType::Lan, 0, 0),
        ];
        for (device_type, sub_type, instance) in wanted {
            let Some(entry) = directory.find(device_type, sub_type, instance) else {
                continue;
            };
            let Some(name) = entry.name() else {
                continue; // Already warned about while decoding
            };

            found.push(Subcomponent {
                device_type: Some(device_type),
                sub_type: entry.sub_type,
                instance: entry.instance,
                name,
                version: entry.version(),
            });
        }

        Ok(found)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.snapshot.as_ref().map(|s| s.data.marketing_name.as_str())
    }

    pub fn serial(&self) -> Option<String> {
        self.snapshot.as_ref().map(|s| s.data.serial())
    }

    pub fn base_type(&self) -> Option<BaseType> {
        self.snapshot.as_ref().map(|s| s.classification.base_type)
    }

    pub fn sku(&self) -> Option<DockSku> {
        self.snapshot.as_ref().map(|s| s.classification.sku)
    }

    pub fn is_device_present(&self, device_type: DeviceType, sub_type: u8, instance: u8) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| s.directory.find(device_type, sub_type, instance).is_some())
    }

    /// Version of a component, or 0 if the dock doesn't have it.
    pub fn get_version(&self, device_type: DeviceType, sub_type: u8, instance: u8) -> u32 {
        self.snapshot
            .as_ref()
            .and_then(|s| s.directory.find(device_type, sub_type, instance))
            .map_or(0, |e| e.version())
    }

    pub fn ec_version(&self) -> u32 {
        self.get_version(DeviceType::MainEc, 0, 0)
    }

    pub fn pd_version(&self, sub_type: u8, instance: u8) -> u32 {
        self.get_version(DeviceType::Pd, sub_type, instance)
    }

    pub fn lan_version(&self) -> u32 {
        self.get_version(DeviceType::Lan, 0, 0)
    }

    pub fn wtpd_version(&self) -> u32 {
        self.get_version(DeviceType::Wtpd, 0, 0)
    }

    pub fn dpmux_version(&self) -> u32 {
        self.get_version(DeviceType::DpMux, 0, 0)
    }

    pub fn rmm_version(&self) -> u32 {
        self.get_version(DeviceType::Rmm, 0, 0)
    }

    /// Version of the firmware package as a whole, from dock data rather than the directory.
    pub fn package_version(&self) -> u32 {
        self.snapshot
            .as_ref()
            .map_or(0, |s| s.data.package_version)
    }
}

fn query(
    transport: &impl Transport,
    command: EcCommand,
    len: usize,
    action: &'static str,
) -> Result<Vec<u8>, Error> {
    transport
        .query(command, len)
        .map_err(|e| Error::DeviceIoError { source: e, action })
}

fn query_dock_data(transport: &impl Transport) -> Result<DockData, Error> {
    let buf = query(
        transport,
        EcCommand::GetDockData,
        DOCK_DATA_SIZE,
        "querying dock data",
    )?;
    let data = DockData::from_bytes(&buf)?;
    debug!(
        "Dock data: {:?}, serial {}, status {:#x}",
        data.marketing_name,
        data.serial(),
        data.dock_status
    );
    Ok(data)
}

/// One readiness attempt: dock data, then dock info, then classification.
fn query_snapshot(transport: &impl Transport, base_type: u8) -> Result<Snapshot, Error> {
    let data = query_dock_data(transport)?;

    let buf = query(
        transport,
        EcCommand::GetDockInfo,
        DOCK_INFO_SIZE,
        "querying dock info",
    )?;
    let directory = DeviceDirectory::from_bytes(&buf)?;
    if directory.is_empty() {
        return Err(ProtocolError::NoDevices.into());
    }
    directory.log_contents();

    let classification = identity::classify(base_type, &directory)?;

    Ok(Snapshot {
        data,
        directory,
        classification,
    })
}

/// All errors (protocol and I/O) that can happen while talking to a dock.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),

    #[error("HID transaction error while {action}")]
    DeviceIoError {
        source: TransportError,
        action: &'static str,
    },
}

impl Error {
    /// Whether the dock may just not be ready yet, so that asking again could succeed.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProtocolError(ProtocolError::MalformedRecord { .. } | ProtocolError::NoDevices)
        )
    }
}

/// Failure modes that can happen even when all I/O succeeds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("{record} response was {actual} bytes, expected {expected}")]
    MalformedRecord {
        record: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("dock reported {0} devices, more than it can have")]
    InvalidDeviceCount(u8),

    #[error("unsupported dock type {0:#04x}")]
    UnsupportedDock(u8),

    #[error("no bridge devices detected, dock may be booting up")]
    NoDevices,

    #[error("dock not ready after {attempts} attempts")]
    DeviceNotReady {
        attempts: u32,
        source: Box<Error>,
    },

    #[error("dock status ({status:#x}) has pending updates, unavailable for now")]
    DockBusy { status: u32 },

    #[error("dock response {response} to chunk {chunk}: failed to write firmware")]
    WriteFailed { chunk: usize, response: u8 },

    #[error("invalid package size {actual}, expected {expected}")]
    InvalidData { expected: usize, actual: usize },

    #[error("firmware payload is empty")]
    EmptyPayload,

    #[error("firmware payload of {0} bytes is too large to send")]
    FileTooLarge(usize),
}
