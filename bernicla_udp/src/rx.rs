//!
//! Cyphal/UDP reception: multi-datagram reassembly with reordering
//!

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crc_any::CRCu32;

use bernicla_core::error::ReassemblyError;
use bernicla_core::session::TransferIdTracker;
use bernicla_core::time::{MonotonicTime, Timestamp};
use bernicla_core::transfer::{DataSpecifier, InputSessionSpecifier, TransferIn};
use bernicla_core::{NodeId, TransferId};
use bernicla_header::FrameHeader;

/// How many transfers may be in flight concurrently per `(data specifier,
/// source)` pair before the oldest is evicted
///
/// Frames of different transfers may interleave arbitrarily on IP networks;
/// this bounds the reorder window across transfers. Within one transfer the
/// window is bounded by the frame count, which the extent already limits.
const CONCURRENT_ASSEMBLIES: usize = 16;

/// What happened to a datagram fed into a reassembly slot
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    Transfer {
        payload: Vec<u8>,
        timestamp: Timestamp,
        transfer_id: TransferId,
    },
    InProgress,
    Ignored,
    Rejected(ReassemblyError),
}

/// One partially reassembled transfer
#[derive(Debug)]
struct Assembly {
    fragments: BTreeMap<u32, Vec<u8>>,
    end_index: Option<u32>,
    accumulated: usize,
    first_frame: Timestamp,
}

impl Assembly {
    fn new(timestamp: Timestamp) -> Self {
        Assembly {
            fragments: BTreeMap::new(),
            end_index: None,
            accumulated: 0,
            first_frame: timestamp,
        }
    }

    /// True once every index from zero through the end frame is present
    fn is_complete(&self) -> bool {
        match self.end_index {
            Some(end) => self.fragments.len() as u64 == u64::from(end) + 1,
            None => false,
        }
    }

    fn into_payload(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.accumulated);
        for fragment in self.fragments.into_values() {
            payload.extend_from_slice(&fragment);
        }
        payload
    }
}

/// Reassembly state for one `(data specifier, source node)` pair
///
/// Transfers are keyed by transfer ID so that datagrams of successive
/// transfers may interleave; the tracker rejects replays once a transfer
/// completes.
#[derive(Debug)]
pub(crate) struct UdpRxSlot {
    tracker: TransferIdTracker,
    assemblies: HashMap<u64, Assembly>,
    /// Insertion order for eviction
    order: VecDeque<u64>,
}

impl UdpRxSlot {
    pub fn new(tolerance: u64) -> Self {
        UdpRxSlot {
            tracker: TransferIdTracker::new(0, tolerance),
            assemblies: HashMap::new(),
            order: VecDeque::new(),
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
        self.expire(timestamp.monotonic, gap_timeout);

        let transfer_id = header.transfer_id;
        // Anything the tracker would reject on completion is dead on arrival
        if !self.tracker.check_strict(transfer_id) {
            return SessionOutcome::Rejected(ReassemblyError::TransferIdRegression);
        }

        if header.is_single_frame() {
            self.assemblies.remove(&transfer_id.to_u64());
            self.order.retain(|&id| id != transfer_id.to_u64());
            if payload.len() > extent {
                return SessionOutcome::Rejected(ReassemblyError::ExtentExceeded);
            }
            self.tracker.accept_strict(transfer_id);
            return SessionOutcome::Transfer {
                payload: payload.to_vec(),
                timestamp,
                transfer_id,
            };
        }

        let key = transfer_id.to_u64();
        if !self.assemblies.contains_key(&key) {
            if self.assemblies.len() >= CONCURRENT_ASSEMBLIES {
                if let Some(evicted) = self.order.pop_front() {
                    self.assemblies.remove(&evicted);
                }
            }
            self.assemblies.insert(key, Assembly::new(timestamp));
            self.order.push_back(key);
        }
        let assembly = self.assemblies.get_mut(&key).expect("Bug: assembly vanished");

        if let Some(end) = assembly.end_index {
            if header.frame_index > end {
                self.drop_assembly(key);
                return SessionOutcome::Rejected(ReassemblyError::FrameIndexOutOfRange);
            }
        }
        if header.end_of_transfer {
            match assembly.end_index {
                None => assembly.end_index = Some(header.frame_index),
                Some(end) if end != header.frame_index => {
                    self.drop_assembly(key);
                    return SessionOutcome::Rejected(ReassemblyError::FrameIndexOutOfRange);
                }
                Some(_) => {}
            }
        }
        if assembly.fragments.contains_key(&header.frame_index) {
            // Duplicate datagram
            return SessionOutcome::Ignored;
        }
        // Multi-frame transfers carry a 4-byte transfer CRC at the end
        if assembly.accumulated + payload.len() > extent + 4 {
            self.drop_assembly(key);
            return SessionOutcome::Rejected(ReassemblyError::ExtentExceeded);
        }
        assembly.accumulated += payload.len();
        assembly
            .fragments
            .insert(header.frame_index, payload.to_vec());

        if !assembly.is_complete() {
            return SessionOutcome::InProgress;
        }

        let assembly = self.assemblies.remove(&key).expect("Bug: assembly vanished");
        self.order.retain(|&id| id != key);
        let first_frame = assembly.first_frame;
        let mut payload = assembly.into_payload();
        if payload.len() < 4 {
            return SessionOutcome::Rejected(ReassemblyError::MalformedFrame);
        }
        let (body, trailer) = payload.split_at(payload.len() - 4);
        let mut crc = CRCu32::crc32c();
        crc.digest(body);
        if crc.get_crc().to_le_bytes() != trailer {
            return SessionOutcome::Rejected(ReassemblyError::CrcMismatch);
        }
        payload.truncate(payload.len() - 4);
        self.tracker.accept_strict(transfer_id);
        SessionOutcome::Transfer {
            payload,
            timestamp: first_frame,
            transfer_id,
        }
    }

    fn drop_assembly(&mut self, key: u64) {
        self.assemblies.remove(&key);
        self.order.retain(|&id| id != key);
    }

    fn expire(&mut self, now: MonotonicTime, gap_timeout: Duration) {
        let stale: Vec<u64> = self
            .assemblies
            .iter()
            .filter(|(_, assembly)| {
                now.saturating_duration_since(assembly.first_frame.monotonic) > gap_timeout
            })
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            self.drop_assembly(key);
        }
    }
}

/// What the receiver did with a datagram, for statistics
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

/// Demultiplexes datagrams into per-session transfer queues
pub(crate) struct Receiver {
    subscriptions: HashMap<InputSessionSpecifier, Subscription>,
    slots: HashMap<(DataSpecifier, NodeId), UdpRxSlot>,
    local_node: Option<NodeId>,
    gap_timeout: Duration,
    tolerance: u64,
    legacy_anonymous_zero: bool,
}

impl Receiver {
    pub fn new(
        local_node: Option<NodeId>,
        gap_timeout: Duration,
        tolerance: u64,
        legacy_anonymous_zero: bool,
    ) -> Self {
        Receiver {
            subscriptions: HashMap::new(),
            slots: HashMap::new(),
            local_node,
            gap_timeout,
            tolerance,
            legacy_anonymous_zero,
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

    /// Returns true if this was the last reference and the session is gone
    pub fn close(&mut self, spec: &InputSessionSpecifier) -> bool {
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
        remove
    }

    /// Whether any remaining session listens on this subject
    pub fn subject_still_wanted(&self, data_specifier: &DataSpecifier) -> bool {
        self.subscriptions
            .keys()
            .any(|spec| spec.data_specifier == *data_specifier)
    }

    pub fn pop(&mut self, spec: &InputSessionSpecifier) -> Option<TransferIn> {
        self.subscriptions
            .get_mut(spec)
            .and_then(|subscription| subscription.queue.pop_front())
    }

    /// Handles one inbound datagram
    pub fn accept(&mut self, datagram: &[u8], timestamp: Timestamp) -> AcceptOutcome {
        let header = match FrameHeader::parse(datagram) {
            Ok(header) => header,
            Err(bernicla_header::HeaderError::UnsupportedVersion(_)) => {
                return AcceptOutcome::Error(ReassemblyError::VersionMismatch)
            }
            Err(_) => return AcceptOutcome::Error(ReassemblyError::MalformedFrame),
        };
        let payload = &datagram[bernicla_header::SIZE..];

        let mut source = header.source;
        if self.legacy_anonymous_zero && source == Some(NodeId::new(0)) {
            source = None;
        }

        if header.data_specifier.is_service() {
            // Service transfers are addressed; ours only
            if header.destination != self.local_node {
                return AcceptOutcome::Dropped;
            }
        }

        let extent = match self.max_extent(&header.data_specifier, source) {
            Some(extent) => extent,
            None => return AcceptOutcome::Dropped,
        };

        match source {
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
                    .or_insert_with(|| UdpRxSlot::new(tolerance));
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
                    SessionOutcome::Ignored => AcceptOutcome::Dropped,
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
            slot.expire(now, gap_timeout);
        }
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.slots.clear();
    }
}
