//! Transfer-level reconstruction of captured serial traffic

use std::collections::HashMap;
use std::time::Duration;

use bernicla_core::error::ReassemblyError;
use bernicla_core::trace::{Capture, CapturedFrame, TraceEvent, TracedTransfer, Tracer};
use bernicla_core::transfer::{DataSpecifier, TransferIn};
use bernicla_core::NodeId;
use bernicla_header::FrameHeader;

use crate::rx::{SerialRxSlot, SessionOutcome};

/// Rebuilds transfers from a chronological stream of captured serial frames
///
/// Captures carry deframed (COBS-decoded) frames, so a tracer can replay
/// either a live capture or a stored dump.
pub struct SerialTracer {
    sessions: HashMap<SessionKey, SerialRxSlot>,
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

impl SerialTracer {
    pub fn new(gap_timeout: Duration, tolerance: u64) -> Self {
        SerialTracer {
            sessions: HashMap::new(),
            gap_timeout,
            tolerance,
            extent: crate::TRACER_EXTENT,
        }
    }
}

impl Tracer for SerialTracer {
    fn update(&mut self, capture: &Capture) -> Option<TraceEvent> {
        let frame = match &capture.frame {
            CapturedFrame::Serial { frame } => frame.as_slice(),
            _ => return None,
        };
        let header = match FrameHeader::parse(frame) {
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
        let payload = &frame[bernicla_header::SIZE..];

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
            .or_insert_with(|| SerialRxSlot::new(tolerance));
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
            SessionOutcome::InProgress => None,
            SessionOutcome::Rejected(error) => Some(TraceEvent::Error {
                timestamp: capture.timestamp,
                error,
            }),
        }
    }
}
