//! Transfer-level reconstruction of captured CAN traffic

use std::collections::HashMap;
use std::convert::TryFrom;
use std::time::Duration;

use bernicla_core::error::ReassemblyError;
use bernicla_core::trace::{Capture, CapturedFrame, TraceEvent, TracedTransfer, Tracer};
use bernicla_core::transfer::{DataSpecifier, TransferIn};
use bernicla_core::NodeId;

use crate::data::CanId;
use crate::rx::{parse_can_id, RxSlot, SessionOutcome, TailByte};

/// Rebuilds transfers from a chronological stream of CAN captures
///
/// Unlike the live receiver the tracer is promiscuous: it follows every
/// source, every destination, and both directions, which makes it usable on
/// logs taken from a bus the local node was not part of.
pub struct CanTracer {
    sessions: HashMap<SessionKey, RxSlot>,
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

impl CanTracer {
    pub fn new(gap_timeout: Duration, tolerance: u64) -> Self {
        CanTracer {
            sessions: HashMap::new(),
            gap_timeout,
            tolerance,
            // Tracers have no subscriptions to size buffers from
            extent: crate::TRACER_EXTENT,
        }
    }
}

impl Tracer for CanTracer {
    fn update(&mut self, capture: &Capture) -> Option<TraceEvent> {
        let (raw_id, data) = match &capture.frame {
            CapturedFrame::Can { id, data } => (*id, data.as_slice()),
            // Captures from other transports cannot belong to this bus
            _ => return None,
        };
        let id = CanId::try_from(raw_id).ok()?;
        let routing = match parse_can_id(id) {
            Ok(routing) => routing,
            Err(_) => {
                return Some(TraceEvent::Error {
                    timestamp: capture.timestamp,
                    error: ReassemblyError::MalformedFrame,
                })
            }
        };
        let (&tail_bits, payload) = match data.split_last() {
            Some(split) => split,
            None => {
                return Some(TraceEvent::Error {
                    timestamp: capture.timestamp,
                    error: ReassemblyError::MalformedFrame,
                })
            }
        };
        let tail = TailByte::parse(tail_bits);

        let source = match routing.source {
            Some(source) => source,
            None => {
                // Anonymous transfers are single-frame by definition
                if !(tail.start && tail.end && tail.toggle) {
                    return Some(TraceEvent::Error {
                        timestamp: capture.timestamp,
                        error: ReassemblyError::AnonymousMultiFrame,
                    });
                }
                return Some(TraceEvent::Transfer(TracedTransfer {
                    data_specifier: routing.data_specifier,
                    destination: routing.destination,
                    transfer: TransferIn {
                        timestamp: capture.timestamp,
                        priority: routing.priority,
                        transfer_id: tail.transfer_id,
                        source: None,
                        payload: payload.to_vec(),
                    },
                }));
            }
        };

        let key = SessionKey {
            source,
            data_specifier: routing.data_specifier,
            destination: routing.destination,
        };
        let tolerance = self.tolerance;
        let slot = self
            .sessions
            .entry(key)
            .or_insert_with(|| RxSlot::new(tolerance));
        match slot.update(
            tail,
            payload,
            capture.timestamp,
            self.extent,
            self.gap_timeout,
        ) {
            SessionOutcome::Transfer { payload, timestamp } => {
                Some(TraceEvent::Transfer(TracedTransfer {
                    data_specifier: routing.data_specifier,
                    destination: routing.destination,
                    transfer: TransferIn {
                        timestamp,
                        priority: routing.priority,
                        transfer_id: tail.transfer_id,
                        source: Some(source),
                        payload,
                    },
                }))
            }
            SessionOutcome::InProgress | SessionOutcome::Ignored => None,
            SessionOutcome::Rejected(error) => Some(TraceEvent::Error {
                timestamp: capture.timestamp,
                error,
            }),
        }
    }
}
