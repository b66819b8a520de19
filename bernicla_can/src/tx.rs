//!
//! Cyphal/CAN transmission
//!

use std::convert::TryFrom;

use bernicla_core::error::{Error, Result};
use bernicla_core::transfer::DataSpecifier;
use bernicla_core::{NodeId, Priority, TransferId};

use crate::crc::TransferCrc;
use crate::data::{CanFrame, CanId, Mtu};
use crate::rx::{TailByte, ANONYMOUS_MARKER};

/// Frame count and last-frame padding for a payload at a given MTU
struct FrameStats {
    frames: usize,
    last_frame_padding: usize,
}

fn frame_stats(payload_length: usize, mtu: Mtu) -> FrameStats {
    let capacity = mtu.as_usize() - 1;
    if payload_length <= capacity {
        // Single frame, no CRC; pad to a length the bus can express
        let rounded = mtu.round_frame_length(payload_length + 1);
        FrameStats {
            frames: 1,
            last_frame_padding: rounded - (payload_length + 1),
        }
    } else {
        let total = payload_length + 2;
        let frames = total.div_ceil(capacity);
        let last_raw = total - (frames - 1) * capacity;
        let rounded = mtu.round_frame_length(last_raw + 1);
        FrameStats {
            frames,
            last_frame_padding: rounded - (last_raw + 1),
        }
    }
}

/// Accumulates payload bytes and spills them into tailed frames
struct Breakdown {
    mtu: usize,
    transfer_id: TransferId,
    toggle: bool,
    start: bool,
    data: Vec<u8>,
}

impl Breakdown {
    fn new(mtu: Mtu, transfer_id: TransferId) -> Self {
        Breakdown {
            mtu: mtu.as_usize(),
            transfer_id,
            toggle: true,
            start: true,
            data: Vec::with_capacity(mtu.as_usize()),
        }
    }

    /// Adds a byte, first spilling the buffer as a non-last frame if full
    ///
    /// Spilling is deferred until the next byte arrives so that an exact fit
    /// ends up in the final frame instead of leaving it empty.
    fn add(&mut self, byte: u8) -> Option<Vec<u8>> {
        let spilled = if self.data.len() == self.mtu - 1 {
            let tail = TailByte {
                start: self.start,
                end: false,
                toggle: self.toggle,
                transfer_id: self.transfer_id,
            };
            let mut frame = core::mem::replace(&mut self.data, Vec::with_capacity(self.mtu));
            frame.push(tail.encode());
            self.start = false;
            self.toggle = !self.toggle;
            Some(frame)
        } else {
            None
        };
        self.data.push(byte);
        spilled
    }

    /// Flushes whatever remains as the final frame
    fn finish(self) -> Vec<u8> {
        let tail = TailByte {
            start: self.start,
            end: true,
            toggle: self.toggle,
            transfer_id: self.transfer_id,
        };
        let mut frame = self.data;
        frame.push(tail.encode());
        frame
    }
}

/// Splits a payload into tailed frames ready for the media
///
/// Multi-frame transfers get zero padding (CAN FD length rounding) and the
/// transfer CRC chained over payload plus padding, spilling into an extra
/// frame when the last data frame has no room left.
pub(crate) fn break_into_frames(
    id: CanId,
    transfer_id: TransferId,
    payload: &[u8],
    mtu: Mtu,
) -> Vec<CanFrame> {
    let stats = frame_stats(payload.len(), mtu);
    let mut breakdown = Breakdown::new(mtu, transfer_id);
    let mut frames = Vec::with_capacity(stats.frames);

    let mut crc = TransferCrc::new();
    let payload_and_padding = payload
        .iter()
        .copied()
        .chain(core::iter::repeat(0).take(stats.last_frame_padding))
        .inspect(|byte| crc.add(*byte));
    for byte in payload_and_padding {
        if let Some(data) = breakdown.add(byte) {
            frames.push(CanFrame { id, data });
        }
    }
    if stats.frames > 1 {
        let crc_value = crc.get();
        for byte in [(crc_value >> 8) as u8, crc_value as u8] {
            if let Some(data) = breakdown.add(byte) {
                frames.push(CanFrame { id, data });
            }
        }
    }
    frames.push(CanFrame {
        id,
        data: breakdown.finish(),
    });
    frames
}

/// Encodes the 29-bit arbitration ID for a transfer
///
/// Anonymous messages carry a pseudo-ID derived from the payload in the
/// source field; receivers discard it.
pub(crate) fn make_can_id(
    priority: Priority,
    source: Option<NodeId>,
    data_specifier: &DataSpecifier,
    destination: Option<NodeId>,
    payload: &[u8],
) -> Result<CanId> {
    let source_bits = match source {
        Some(node) => u16::from(node),
        None => make_pseudo_id(payload),
    };
    let mut bits = u32::from(priority.to_u8()) << 26;
    bits |= u32::from(source_bits & 0x7f);

    match data_specifier {
        DataSpecifier::Subject(subject) => {
            bits |= u32::from(u16::from(*subject)) << 8;
            // Bits 21 and 22 are transmitted as ones on message frames
            bits |= (1 << 21) | (1 << 22);
            if source.is_none() {
                bits |= 1 << 24;
            }
        }
        DataSpecifier::ServiceRequest(service) => {
            let destination = destination.ok_or_else(|| {
                Error::InvalidTransportConfiguration(
                    "service request without a destination".into(),
                )
            })?;
            bits |= common_service_fields(u16::from(*service), destination);
            bits |= 1 << 24;
        }
        DataSpecifier::ServiceResponse(service) => {
            let destination = destination.ok_or_else(|| {
                Error::InvalidTransportConfiguration(
                    "service response without a destination".into(),
                )
            })?;
            bits |= common_service_fields(u16::from(*service), destination);
        }
    }

    Ok(CanId::try_from(bits).expect("Bug: generated CAN ID does not fit into 29 bits"))
}

fn common_service_fields(service: u16, destination: NodeId) -> u32 {
    (u32::from(service) << 14) | (u32::from(u16::from(destination) & 0x7f) << 7) | (1 << 25)
}

/// Folds the payload into a 7-bit pseudo source ID for anonymous messages
fn make_pseudo_id(payload: &[u8]) -> u16 {
    let bits = payload
        .iter()
        .fold(ANONYMOUS_MARKER as u8, |state, byte| state ^ *byte);
    u16::from(bits & 0x7f)
}
