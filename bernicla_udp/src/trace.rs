//! Transfer-level reconstruction of captured UDP traffic

use std::collections::HashMap;
use std::time::Duration;

use bernicla_core::error::ReassemblyError;
use bernicla_core::trace::{Capture, CapturedFrame, TraceEvent, TracedTransfer, Tracer};
use bernicla_core::transfer::{DataSpecifier, TransferIn};
use bernicla_core::NodeId;
use bernicla_header::FrameHeader;

use crate::rx::{SessionOutcome, UdpRxSlot};

/// Rebuilds transfers from a chronological stream of captured datagrams
pub struct UdpTracer {
    sessions: HashMap<SessionKey, UdpRxSlot>,
    gap_timeout: Duration,
    tolerance: u64,
    extent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    source: NodeId,
    data_specifier: DataSpecifier,
    destination: Option<NodeId>,
}

impl UdpTracer {
    pub fn new(gap_timeout: Duration, tolerance: u64) -> Self {
        UdpTracer {
            sessions: HashMap::new(),
            gap_timeout,
            tolerance,
            extent: crate::TRACER_EXTENT,
        }
    }
}

impl Tracer for UdpTracer {
    fn update(&mut self, capture: &Capture) -> Option<TraceEvent> {
        let datagram = match &capture.frame {
            CapturedFrame::Udp { datagram } => datagram.as_slice(),
            _ => return None,
        };
        let header = match FrameHeader::parse(datagram) {
            Ok(header) => header,
            Err(bernicla_header::HeaderError::UnsupportedVersion(_)) => {
                return Some(TraceEvent::Error {
                    timestamp: capture.timestamp,
                    error: ReassemblyError::VersionMismatch,
                })
            }
            Err(_) => {
                return Some(TraceEvent::Error {
                    timestamp: capture.timestamp,
                    error: ReassemblyError::MalformedFrame,
                })
            }
        };
        let payload = &datagram[bernicla_header::SIZE..];

        let source = match header.source {
            Some(source) => source,
            None => {
                if !header.is_single_frame() {
                    return Some(TraceEvent::Error {
                        timestamp: capture.timestamp,
                        error: ReassemblyError::AnonymousMultiFrame,
                    });
                }
                return Some(TraceEvent::Transfer(TracedTransfer {
                    data_specifier: header.data_specifier,
                    destination: header.destination,
                    transfer: TransferIn {
                        timestamp: capture.timestamp,
                        priority: header.priority,
                        transfer_id: header.transfer_id,
                        source: None,
                        payload: payload.to_vec(),
                    },
                }));
            }
        };

        let key = SessionKey {
            source,
            data_specifier: header.data_specifier,
            destination: header.destination,
        };
        let tolerance = self.tolerance;
        let slot = self
            .sessions
            .entry(key)
            .or_insert_with(|| UdpRxSlot::new(tolerance));
        match slot.update(
            &header,
            payload,
            capture.timestamp,
            self.extent,
            self.gap_timeout,
        ) {
            SessionOutcome::Transfer {
                payload,
                timestamp,
                transfer_id,
            } => Some(TraceEvent::Transfer(TracedTransfer {
                data_specifier: header.data_specifier,
                destination: header.destination,
                transfer: TransferIn {
                    timestamp,
                    priority: header.priority,
                    transfer_id,
                    source: Some(source),
                    payload,
                },
            })),
            SessionOutcome::InProgress | SessionOutcome::Ignored => None,
            SessionOutcome::Rejected(error) => Some(TraceEvent::Error {
                timestamp: capture.timestamp,
                error,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom;

    use crc_any::CRCu32;

    use bernicla_core::time::Timestamp;
    use bernicla_core::trace::Direction;
    use bernicla_core::{Priority, SubjectId, TransferId};

    fn header(frame_index: u32, end_of_transfer: bool) -> FrameHeader {
        FrameHeader {
            priority: Priority::Nominal,
            source: Some(NodeId::new(9)),
            destination: None,
            data_specifier: DataSpecifier::Subject(SubjectId::try_from(321).unwrap()),
            transfer_id: TransferId::new(6),
            frame_index,
            end_of_transfer,
        }
    }

    fn capture_of(header: FrameHeader, payload: &[u8]) -> Capture {
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(payload);
        Capture {
            timestamp: Timestamp::now(),
            direction: Direction::Rx,
            frame: CapturedFrame::Udp { datagram },
        }
    }

    #[test]
    fn reconstructs_out_of_order_datagrams() {
        let payload: Vec<u8> = (0..40).collect();
        let mut crc = CRCu32::crc32c();
        crc.digest(&payload);
        let mut body = payload.clone();
        body.extend_from_slice(&crc.get_crc().to_le_bytes());
        let (first, second) = body.split_at(30);

        let mut tracer = UdpTracer::new(std::time::Duration::from_secs(2), u64::MAX / 2);
        // The terminal datagram arrives first; the reorder window holds it
        assert!(tracer
            .update(&capture_of(header(1, true), second))
            .is_none());
        match tracer.update(&capture_of(header(0, false), first)) {
            Some(TraceEvent::Transfer(traced)) => {
                assert_eq!(traced.transfer.payload, payload);
                assert_eq!(traced.transfer.transfer_id, TransferId::new(6));
            }
            other => panic!("expected a transfer, got {:?}", other),
        }
    }

    #[test]
    fn corrupted_transfer_crc_reported() {
        let payload: Vec<u8> = (0..40).collect();
        let mut body = payload.clone();
        // Wrong transfer CRC
        body.extend_from_slice(&[0, 0, 0, 0]);
        let (first, second) = body.split_at(30);

        let mut tracer = UdpTracer::new(std::time::Duration::from_secs(2), u64::MAX / 2);
        assert!(tracer
            .update(&capture_of(header(0, false), first))
            .is_none());
        match tracer.update(&capture_of(header(1, true), second)) {
            Some(TraceEvent::Error { error, .. }) => {
                assert_eq!(error, ReassemblyError::CrcMismatch)
            }
            other => panic!("expected a CRC error, got {:?}", other),
        }
    }
}
