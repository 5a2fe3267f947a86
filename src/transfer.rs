use crate::directory::DeviceType;
use crate::protocol::{Error, ProtocolError};
use crate::transport::{PAGE_SIZE, Transport};
use byteorder::{BE, WriteBytesExt};
use log::{debug, info, trace};
use num_enum::TryFromPrimitive;
use std::time::Duration;

// Write data, firmware update extension, chunk length
const FWUP_HEADER_SIZE: usize = 1 + 1 + 4;
// Sub-command, device type, device identifier, payload size
const FWUP_COMMAND_SIZE: usize = 1 + 1 + 1 + 4;

/// Bytes prepended to every chunk before it is split into pages.
pub const FRAME_OVERHEAD: usize = FWUP_HEADER_SIZE + FWUP_COMMAND_SIZE;

const HID_CMD_WRITE_DATA: u8 = 0x40;
const HID_EXT_FWUPDATE: u8 = 0x80;
const HID_SUBCMD_FWUPDATE: u8 = 0x00;

// Largest payload whose chunk length still fits the header's 32-bit field.
const MAX_PAYLOAD_SIZE: usize = (u32::MAX as usize) - FWUP_COMMAND_SIZE;

// Chunk sizes the dock firmware expects. Only the EC takes smaller chunks.
const EC_CHUNK_SIZE: usize = 160_000;
const ANY_CHUNK_SIZE: usize = 180_000;

// Byte of the acknowledgement report carrying a ChunkResponse.
const ACK_OFFSET: usize = 1;

/// The dock's verdict on a chunk it has received.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
enum ChunkResponse {
    UpdateComplete = 1,
    SendNextChunk = 2,
    UpdateFailed = 3,
}

/// How a class of device wants its firmware delivered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChunkPolicy {
    /// Maximum bytes of payload per chunk. [None] sends the whole payload as one chunk.
    pub chunk_size: Option<usize>,
    /// Time the dock needs to flash a chunk before it can acknowledge it.
    pub chunk_delay: Duration,
    /// Time the dock needs after the first page of each chunk.
    pub first_page_delay: Duration,
}

impl ChunkPolicy {
    pub const fn for_device(device_type: DeviceType) -> Self {
        use DeviceType::*;

        const fn policy(chunk_size: Option<usize>, chunk_ms: u64, first_page_ms: u64) -> ChunkPolicy {
            ChunkPolicy {
                chunk_size,
                chunk_delay: Duration::from_millis(chunk_ms),
                first_page_delay: Duration::from_millis(first_page_ms),
            }
        }

        match device_type {
            MainEc => policy(Some(EC_CHUNK_SIZE), 3_000, 0),
            Rmm => policy(None, 60_000, 75_000),
            Pd => policy(Some(ANY_CHUNK_SIZE), 15_000, 0),
            Lan => policy(Some(ANY_CHUNK_SIZE), 70_000, 0),
            UsbHub | Mst | Tbt | Qi | DpMux | Fan | Wtpd => policy(Some(ANY_CHUNK_SIZE), 30_000, 0),
        }
    }
}

/// Write `payload` to a dock component. `identifier` picks the unit for device types with more
/// than one (e.g. the PD port). Blocks for as long as the dock needs to flash every chunk, which
/// can be minutes.
///
/// An empty payload fails with [ProtocolError::EmptyPayload] without touching the dock, rather
/// than succeeding as a transfer of zero chunks.
pub fn write_firmware(
    transport: &impl Transport,
    payload: &[u8],
    device_type: DeviceType,
    identifier: u8,
) -> Result<(), Error> {
    let policy = ChunkPolicy::for_device(device_type);
    write_firmware_with_policy(transport, payload, device_type, identifier, &policy)
}

pub(crate) fn write_firmware_with_policy(
    transport: &impl Transport,
    payload: &[u8],
    device_type: DeviceType,
    identifier: u8,
    policy: &ChunkPolicy,
) -> Result<(), Error> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyPayload.into());
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FileTooLarge(payload.len()).into());
    }

    let chunk_size = policy.chunk_size.unwrap_or(payload.len());
    let chunk_count = payload.len().div_ceil(chunk_size);
    info!(
        "Writing {} bytes to {device_type:?} #{identifier} in {chunk_count} chunk(s)",
        payload.len()
    );

    for (i, chunk) in payload.chunks(chunk_size).enumerate() {
        let framed = frame_chunk(chunk, payload.len(), device_type, identifier);

        for (j, page) in framed.chunks(PAGE_SIZE).enumerate() {
            let mut aligned = [0xffu8; PAGE_SIZE];
            aligned[..page.len()].copy_from_slice(page);

            trace!("Sending chunk {i}, page {j}");
            transport
                .write_page(&aligned)
                .map_err(|e| Error::DeviceIoError {
                    source: e,
                    action: "sending firmware page",
                })?;

            if j == 0 && !policy.first_page_delay.is_zero() {
                debug!("Waiting {:?} before the next page", policy.first_page_delay);
                transport.sleep(policy.first_page_delay);
            }
        }

        debug!("Waiting {:?} for dock to finish chunk {i}", policy.chunk_delay);
        transport.sleep(policy.chunk_delay);

        let report = transport.read_report().map_err(|e| Error::DeviceIoError {
            source: e,
            action: "reading chunk acknowledgement",
        })?;

        let response = report[ACK_OFFSET];
        match ChunkResponse::try_from(response) {
            Ok(ChunkResponse::UpdateComplete) => {
                debug!("Dock response {response} to chunk {i}: firmware updated")
            }
            Ok(ChunkResponse::SendNextChunk) => {
                debug!("Dock response {response} to chunk {i}: send next chunk")
            }
            Ok(ChunkResponse::UpdateFailed) | Err(_) => {
                return Err(ProtocolError::WriteFailed { chunk: i, response }.into());
            }
        }
    }

    info!("Firmware written successfully");
    Ok(())
}

/// Prepend the firmware update header to a chunk. `payload_size` must already be known to fit the
/// header fields.
fn frame_chunk(chunk: &[u8], payload_size: usize, device_type: DeviceType, identifier: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + chunk.len());

    buf.write_u8(HID_CMD_WRITE_DATA).unwrap();
    buf.write_u8(HID_EXT_FWUPDATE).unwrap();
    buf.write_u32::<BE>((FWUP_COMMAND_SIZE + chunk.len()) as u32)
        .unwrap();

    buf.write_u8(HID_SUBCMD_FWUPDATE).unwrap();
    buf.write_u8(device_type as u8).unwrap();
    buf.write_u8(identifier).unwrap();
    buf.write_u32::<BE>(payload_size as u32).unwrap();
    assert!(buf.len() == FRAME_OVERHEAD);

    buf.extend_from_slice(chunk);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, MockTransport};

    const COMPLETE: u8 = ChunkResponse::UpdateComplete as u8;
    const NEXT: u8 = ChunkResponse::SendNextChunk as u8;
    const FAILED: u8 = ChunkResponse::UpdateFailed as u8;

    fn small_policy(chunk_size: usize) -> ChunkPolicy {
        ChunkPolicy {
            chunk_size: Some(chunk_size),
            chunk_delay: Duration::from_millis(10),
            first_page_delay: Duration::ZERO,
        }
    }

    #[test]
    fn policy_table() {
        let ec = ChunkPolicy::for_device(DeviceType::MainEc);
        let pd = ChunkPolicy::for_device(DeviceType::Pd);
        let lan = ChunkPolicy::for_device(DeviceType::Lan);
        let tbt = ChunkPolicy::for_device(DeviceType::Tbt);
        let rmm = ChunkPolicy::for_device(DeviceType::Rmm);

        assert_eq!(ec.chunk_delay, Duration::from_secs(3));
        assert_eq!(pd.chunk_delay, Duration::from_secs(15));
        assert_eq!(lan.chunk_delay, Duration::from_secs(70));
        assert_eq!(tbt.chunk_delay, Duration::from_secs(30));
        assert_eq!(rmm.chunk_delay, Duration::from_secs(60));
        assert_eq!(rmm.first_page_delay, Duration::from_secs(75));
        assert_eq!(rmm.chunk_size, None);
        assert_eq!(ec.chunk_size, Some(160_000));
        assert_eq!(pd.chunk_size, Some(180_000));
        assert_eq!(lan.chunk_size, Some(180_000));
        assert_eq!(tbt.chunk_size, Some(180_000));
        for device_type in [
            DeviceType::UsbHub,
            DeviceType::Mst,
            DeviceType::Qi,
            DeviceType::DpMux,
            DeviceType::Fan,
            DeviceType::Wtpd,
        ] {
            assert_eq!(ChunkPolicy::for_device(device_type), tbt);
        }
        assert!([ec, pd, lan, tbt].iter().all(|p| p.first_page_delay.is_zero()));
    }

    #[test]
    fn frame_header() {
        let framed = frame_chunk(&[0xaa, 0xbb], 0x01020304, DeviceType::Pd, 2);
        assert_eq!(
            framed,
            [
                0x40, 0x80, 0x00, 0x00, 0x00, 0x09, // header
                0x00, 0x01, 0x02, 0x01, 0x02, 0x03, 0x04, // command
                0xaa, 0xbb,
            ]
        );
    }

    #[test]
    fn single_chunk_pages_are_padded() {
        let chunk_size = ChunkPolicy::for_device(DeviceType::MainEc).chunk_size.unwrap();
        let payload: Vec<u8> = (0..chunk_size).map(|i| i as u8).collect();

        let mock = MockTransport::new();
        mock.queue_ack(COMPLETE);
        write_firmware(&mock, &payload, DeviceType::MainEc, 0).unwrap();

        let framed_len = FRAME_OVERHEAD + chunk_size;
        let pages = mock.pages();
        assert_eq!(pages.len(), framed_len.div_ceil(PAGE_SIZE));
        assert!(pages.iter().all(|p| p.len() == PAGE_SIZE));

        // Payload starts right after the header.
        assert_eq!(&pages[0][FRAME_OVERHEAD..FRAME_OVERHEAD + 3], &[0, 1, 2]);

        let tail = framed_len % PAGE_SIZE;
        assert_ne!(tail, 0);
        let last = pages.last().unwrap();
        assert_eq!(last[tail - 1], payload[chunk_size - 1]);
        assert!(last[tail..].iter().all(|&b| b == 0xff));

        assert_eq!(mock.sleeps(), vec![Duration::from_secs(3)]);
        assert_eq!(mock.events().last(), Some(&Event::ReadReport));
    }

    #[test]
    fn tbt_payload_splits_at_chunk_size() {
        let mock = MockTransport::new();
        mock.queue_ack(NEXT);
        mock.queue_ack(COMPLETE);

        let payload = vec![0u8; 190_000];
        write_firmware(&mock, &payload, DeviceType::Tbt, 0).unwrap();

        let acks = mock
            .events()
            .iter()
            .filter(|e| **e == Event::ReadReport)
            .count();
        assert_eq!(acks, 2);
        assert_eq!(mock.sleeps(), vec![Duration::from_secs(30); 2]);

        // Second chunk header carries the 10 000 byte remainder.
        let first_chunk_pages = (FRAME_OVERHEAD + 180_000).div_ceil(PAGE_SIZE);
        let second = &mock.pages()[first_chunk_pages];
        assert_eq!(&second[2..6], &(7u32 + 10_000).to_be_bytes());
        assert_eq!(&second[9..13], &190_000u32.to_be_bytes());
    }

    #[test]
    fn chunks_carry_total_payload_size() {
        let mock = MockTransport::new();
        mock.queue_ack(NEXT);
        mock.queue_ack(COMPLETE);

        let payload = [0x11u8; 15];
        write_firmware_with_policy(&mock, &payload, DeviceType::Lan, 0, &small_policy(10)).unwrap();

        let pages = mock.pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(&pages[0][2..6], &[0, 0, 0, 17]); // 7 + 10
        assert_eq!(&pages[1][2..6], &[0, 0, 0, 12]); // 7 + 5
        for page in &pages {
            assert_eq!(page[7], DeviceType::Lan as u8);
            assert_eq!(&page[9..13], &[0, 0, 0, 15]);
        }
    }

    #[test]
    fn failed_ack_aborts_transfer() {
        let mock = MockTransport::new();
        mock.queue_ack(NEXT);
        mock.queue_ack(FAILED);

        let payload = [0u8; 50];
        let result = write_firmware_with_policy(&mock, &payload, DeviceType::Pd, 1, &small_policy(10));

        assert!(matches!(
            result,
            Err(Error::ProtocolError(ProtocolError::WriteFailed {
                chunk: 1,
                response: FAILED
            }))
        ));
        // Two of five chunks sent, one page each.
        assert_eq!(mock.pages().len(), 2);
    }

    #[test]
    fn unknown_ack_aborts_transfer() {
        let mock = MockTransport::new();
        mock.queue_ack(0x7f);

        let result = write_firmware_with_policy(&mock, &[1, 2, 3], DeviceType::Fan, 0, &small_policy(10));
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolError(ProtocolError::WriteFailed {
                chunk: 0,
                response: 0x7f
            })
        ));
        assert_eq!(
            err.to_string(),
            "dock response 127 to chunk 0: failed to write firmware"
        );
    }

    #[test]
    fn missing_ack_propagates_transport_error() {
        let mock = MockTransport::new();
        let result = write_firmware_with_policy(&mock, &[1, 2, 3], DeviceType::Fan, 0, &small_policy(10));
        assert!(matches!(
            result,
            Err(Error::DeviceIoError {
                action: "reading chunk acknowledgement",
                ..
            })
        ));
    }

    #[test]
    fn rmm_waits_after_first_page() {
        let mock = MockTransport::new();
        mock.queue_ack(COMPLETE);

        // Three pages, one chunk.
        let payload = vec![0u8; 2 * PAGE_SIZE];
        write_firmware(&mock, &payload, DeviceType::Rmm, 0).unwrap();

        let events = mock.events();
        assert!(matches!(events[0], Event::Page(_)));
        assert_eq!(events[1], Event::Sleep(Duration::from_secs(75)));
        assert!(matches!(events[2], Event::Page(_)));
        assert!(matches!(events[3], Event::Page(_)));
        assert_eq!(events[4], Event::Sleep(Duration::from_secs(60)));
        assert_eq!(events[5], Event::ReadReport);
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let mock = MockTransport::new();
        assert!(matches!(
            write_firmware(&mock, &[], DeviceType::MainEc, 0),
            Err(Error::ProtocolError(ProtocolError::EmptyPayload))
        ));
        assert!(mock.events().is_empty());
    }
}
