//!
//! Cyphal/serial reception
//!
//! The link delivers frames in order, so reassembly is sequential: frame
//! indexes must count up from zero with no gaps, the way CAN toggles
//! alternate, but with the 64-bit transfer ID of the common header.
//!

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crc_any::CRCu32;

use bernicla_core::error::ReassemblyError;
use bernicla_core::session::TransferIdTracker;
use bernicla_core::time::{MonotonicTime, Timestamp};
use bernicla_core::transfer::{DataSpecifier, InputSessionSpecifier, TransferIn};
use bernicla_core::{NodeId, TransferId};
use bernicla_header::FrameHeader;

#[derive(Debug)]
pub(crate) enum SessionOutcome {
    Transfer {
        payload: Vec<u8>,
        timestamp: Timestamp,
        transfer_id: TransferId,
    },
    InProgress,
    Rejected(ReassemblyError),
}

#[derive(Debug)]
struct Buildup {
    transfer_id: TransferId,
    next_index: u32,
    payload: Vec<u8>,
    first_frame: Timestamp,
}

/// Reassembly state for one `(data specifier, source node)` pair
#[derive(Debug)]
pub(crate) struct SerialRxSlot {
    tracker: TransferIdTracker,
    current: Option<Buildup>,
}

impl SerialRxSlot {
    pub fn new(tolerance: u64) -> Self {
        SerialRxSlot {
            tracker: TransferIdTracker::new(0, tolerance),
            current: None,
        }
    }

    pub fn update(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        timestamp: Timestamp,
        extent: usize,
        gap_timeout: Duration,
    ) -> SessionOutcome {
        if let Some(buildup) = &self.current {
            let age = timestamp
                .monotonic
                .saturating_duration_since(buildup.first_frame.monotonic);
            if age > gap_timeout {
                self.current = None;
            }
        }

        if header.frame_index == 0 {
            // Start of a transfer; supersedes anything in progress
            self.current = None;
            if !self.tracker.check_strict(header.transfer_id) {
                return SessionOutcome::Rejected(ReassemblyError::TransferIdRegression);
            }
            if header.end_of_transfer {
                if payload.len() > extent {
                    return SessionOutcome::Rejected(ReassemblyError::ExtentExceeded);
                }
                self.tracker.accept_strict(header.transfer_id);
                return SessionOutcome::Transfer {
                    payload: payload.to_vec(),
                    timestamp,
                    transfer_id: header.transfer_id,
                };
            }
            self.current = Some(Buildup {
                transfer_id: header.transfer_id,
                next_index: 1,
                payload: payload.to_vec(),
                first_frame: timestamp,
            });
            return SessionOutcome::InProgress;
        }

        let buildup = match &mut self.current {
            Some(buildup) => buildup,
            None => return SessionOutcome::Rejected(ReassemblyError::MissedStart),
        };
        if header.transfer_id != buildup.transfer_id || header.frame_index != buildup.next_index
        {
            self.current = None;
            return SessionOutcome::Rejected(ReassemblyError::FrameIndexOutOfRange);
        }
        // Multi-frame transfers carry a 4-byte transfer CRC at the end
        if buildup.payload.len() + payload.len() > extent + 4 {
            self.current = None;
            return SessionOutcome::Rejected(ReassemblyError::ExtentExceeded);
        }
        buildup.payload.extend_from_slice(payload);
        buildup.next_index += 1;
        if !header.end_of_transfer {
            return SessionOutcome::InProgress;
        }

        let buildup = self.current.take().expect("Bug: buildup vanished");
        if buildup.payload.len() < 4 {
            return SessionOutcome::Rejected(ReassemblyError::MalformedFrame);
        }
        let (body, trailer) = buildup.payload.split_at(buildup.payload.len() - 4);
        let mut crc = CRCu32::crc32c();
        crc.digest(body);
        if crc.get_crc().to_le_bytes() != trailer {
            return SessionOutcome::Rejected(ReassemblyError::CrcMismatch);
        }
        let mut payload = buildup.payload;
        payload.truncate(payload.len() - 4);
        self.tracker.accept_strict(header.transfer_id);
        SessionOutcome::Transfer {
            payload,
            timestamp: buildup.first_frame,
            transfer_id: header.transfer_id,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AcceptOutcome {
    TransferDelivered,
    Consumed,
    Dropped,
    Error(ReassemblyError),
}

struct Subscription {
    extent: usize,
    refs: usize,
    queue: VecDeque<TransferIn>,
}

/// Demultiplexes decoded frames into per-session transfer queues
pub(crate) struct Receiver {
    subscriptions: HashMap<InputSessionSpecifier, Subscription>,
    slots: HashMap<(DataSpecifier, NodeId), SerialRxSlot>,
    local_node: Option<NodeId>,
    gap_timeout: Duration,
    tolerance: u64,
}

impl Receiver {
    pub fn new(local_node: Option<NodeId>, gap_timeout: Duration, tolerance: u64) -> Self {
        Receiver {
            subscriptions: HashMap::new(),
            slots: HashMap::new(),
            local_node,
            gap_timeout,
            tolerance,
        }
    }

    pub fn open(&mut self, spec: &InputSessionSpecifier, extent: usize) {
        let subscription = self
            .subscriptions
            .entry(*spec)
            .or_insert_with(|| Subscription {
                extent,
                refs: 0,
                queue: VecDeque::new(),
            });
        subscription.refs += 1;
        subscription.extent = subscription.extent.max(extent);
    }

    pub fn close(&mut self, spec: &InputSessionSpecifier) {
        let remove = match self.subscriptions.get_mut(spec) {
            Some(subscription) => {
                subscription.refs = subscription.refs.saturating_sub(1);
                subscription.refs == 0
            }
            None => false,
        };
        if remove {
            self.subscriptions.remove(spec);
            let subscriptions = &self.subscriptions;
            self.slots.retain(|(ds, source), _| {
                subscriptions
                    .iter()
                    .any(|(s, _)| s.data_specifier == *ds && s.accepts(Some(*source)))
            });
        }
    }

    pub fn pop(&mut self, spec: &InputSessionSpecifier) -> Option<TransferIn> {
        self.subscriptions
            .get_mut(spec)
            .and_then(|subscription| subscription.queue.pop_front())
    }

    /// Handles one decoded frame
    pub fn accept(&mut self, frame: &[u8], timestamp: Timestamp) -> AcceptOutcome {
        let header = match FrameHeader::parse(frame) {
            Ok(header) => header,
            Err(bernicla_header::HeaderError::UnsupportedVersion(_)) => {
                return AcceptOutcome::Error(ReassemblyError::VersionMismatch)
            }
            Err(_) => return AcceptOutcome::Error(ReassemblyError::MalformedFrame),
        };
        let payload = &frame[bernicla_header::SIZE..];

        if header.data_specifier.is_service() && header.destination != self.local_node {
            return AcceptOutcome::Dropped;
        }

        let extent = match self.max_extent(&header.data_specifier, header.source) {
            Some(extent) => extent,
            None => return AcceptOutcome::Dropped,
        };

        match header.source {
            None => {
                if !header.is_single_frame() {
                    return AcceptOutcome::Error(ReassemblyError::AnonymousMultiFrame);
                }
                if payload.len() > extent {
                    return AcceptOutcome::Error(ReassemblyError::ExtentExceeded);
                }
                let transfer = TransferIn {
                    timestamp,
                    priority: header.priority,
                    transfer_id: header.transfer_id,
                    source: None,
                    payload: payload.to_vec(),
                };
                self.deliver(&header.data_specifier, None, transfer)
            }
            Some(node) => {
                let tolerance = self.tolerance;
                let slot = self
                    .slots
                    .entry((header.data_specifier, node))
                    .or_insert_with(|| SerialRxSlot::new(tolerance));
                match slot.update(&header, payload, timestamp, extent, self.gap_timeout) {
                    SessionOutcome::Transfer {
                        payload,
                        timestamp,
                        transfer_id,
                    } => {
                        let transfer = TransferIn {
                            timestamp,
                            priority: header.priority,
                            transfer_id,
                            source: Some(node),
                            payload,
                        };
                        self.deliver(&header.data_specifier, Some(node), transfer)
                    }
                    SessionOutcome::InProgress => AcceptOutcome::Consumed,
                    SessionOutcome::Rejected(error) => AcceptOutcome::Error(error),
                }
            }
        }
    }

    fn deliver(
        &mut self,
        data_specifier: &DataSpecifier,
        source: Option<NodeId>,
        transfer: TransferIn,
    ) -> AcceptOutcome {
        let mut delivered = false;
        for (spec, subscription) in self.subscriptions.iter_mut() {
            if spec.data_specifier == *data_specifier && spec.accepts(source) {
                subscription.queue.push_back(transfer.clone());
                delivered = true;
            }
        }
        if delivered {
            AcceptOutcome::TransferDelivered
        } else {
            AcceptOutcome::Dropped
        }
    }

    fn max_extent(&self, data_specifier: &DataSpecifier, source: Option<NodeId>) -> Option<usize> {
        self.subscriptions
            .iter()
            .filter(|(spec, _)| spec.data_specifier == *data_specifier && spec.accepts(source))
            .map(|(_, subscription)| subscription.extent)
            .max()
    }

    pub fn clean_expired(&mut self, now: MonotonicTime) {
        let gap_timeout = self.gap_timeout;
        for slot in self.slots.values_mut() {
            if let Some(buildup) = &slot.current {
                if now.saturating_duration_since(buildup.first_frame.monotonic) > gap_timeout {
                    slot.current = None;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.slots.clear();
    }
}
