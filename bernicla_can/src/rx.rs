//!
//! Cyphal/CAN reception
//!

use std::collections::HashMap;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::time::Duration;

use bernicla_core::error::ReassemblyError;
use bernicla_core::session::TransferIdTracker;
use bernicla_core::time::{MonotonicTime, Timestamp};
use bernicla_core::transfer::{DataSpecifier, InputSessionSpecifier, TransferIn};
use bernicla_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

use crate::crc::TransferCrc;
use crate::data::CanId;

/// The node-ID value that marks a message as anonymous
pub(crate) const ANONYMOUS_MARKER: u16 = 0x7f;

/// Routing information parsed out of a 29-bit CAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CanRouting {
    pub priority: Priority,
    /// `None` when the anonymous flag is set
    pub source: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    /// `Some` for service transfers, `None` for messages
    pub destination: Option<NodeId>,
}

#[derive(Debug)]
pub(crate) enum CanIdParseError {
    /// Reserved bit 23 was set
    Bit23Set,
    /// On a message frame, reserved bit 7 was set
    Bit7Set,
}

pub(crate) fn parse_can_id(id: CanId) -> Result<CanRouting, CanIdParseError> {
    let bits = u32::from(id);

    if bits.bit_set(23) {
        return Err(CanIdParseError::Bit23Set);
    }
    // Bits 22 and 21 are ignored on reception

    let priority = Priority::try_from(bits.get_u8(26) & 0x7).expect("Bug: invalid priority");
    let source_bits = u16::from(bits.get_u8(0) & 0x7f);

    if bits.bit_set(25) {
        // Service
        let service =
            ServiceId::try_from(bits.get_u16(14) & 0x1ff).expect("Bug: invalid service ID");
        let destination = NodeId::new(u16::from(bits.get_u8(7) & 0x7f));
        let data_specifier = if bits.bit_set(24) {
            DataSpecifier::ServiceRequest(service)
        } else {
            DataSpecifier::ServiceResponse(service)
        };
        Ok(CanRouting {
            priority,
            source: Some(NodeId::new(source_bits)),
            data_specifier,
            destination: Some(destination),
        })
    } else {
        // Message
        if bits.bit_set(7) {
            return Err(CanIdParseError::Bit7Set);
        }
        let subject = SubjectId::from_truncating(bits.get_u16(8));
        let source = if bits.bit_set(24) {
            // Anonymous: the source field carries a meaningless pseudo-ID
            None
        } else {
            Some(NodeId::new(source_bits))
        };
        Ok(CanRouting {
            priority,
            source,
            data_specifier: DataSpecifier::Subject(subject),
            destination: None,
        })
    }
}

/// The tail byte carried in the last data byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TailByte {
    pub start: bool,
    pub end: bool,
    pub toggle: bool,
    pub transfer_id: TransferId,
}

impl TailByte {
    pub fn parse(bits: u8) -> Self {
        TailByte {
            start: bits.bit_set(7),
            end: bits.bit_set(6),
            toggle: bits.bit_set(5),
            transfer_id: TransferId::new(u64::from(bits & 0x1f)),
        }
    }

    pub fn encode(&self) -> u8 {
        let mut bits = (self.transfer_id.to_u64() & 0x1f) as u8;
        if self.start {
            bits |= 1 << 7;
        }
        if self.end {
            bits |= 1 << 6;
        }
        if self.toggle {
            bits |= 1 << 5;
        }
        bits
    }
}

/// What happened to a frame fed into a reassembly slot
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    /// The frame completed a transfer
    Transfer {
        payload: Vec<u8>,
        timestamp: Timestamp,
    },
    /// The frame was consumed; the transfer needs more frames
    InProgress,
    /// The frame belongs to a transfer this slot is not interested in
    Ignored,
    /// The frame broke the transfer in progress or was unusable
    Rejected(ReassemblyError),
}

/// An in-progress multi-frame reassembly
#[derive(Debug)]
struct Buildup {
    transfer_id: TransferId,
    expected_toggle: bool,
    payload: Vec<u8>,
    frames: usize,
    /// Timestamp of the first frame; becomes the transfer timestamp
    first_frame: Timestamp,
}

/// Reassembly state for one `(data specifier, source node)` pair
///
/// Owns the transfer-ID window and at most one transfer in progress. One slot
/// exists per pair regardless of how many input sessions listen to it.
#[derive(Debug)]
pub(crate) struct RxSlot {
    tracker: TransferIdTracker,
    current: Option<Buildup>,
}

impl RxSlot {
    pub fn new(tolerance: u64) -> Self {
        RxSlot {
            tracker: TransferIdTracker::new(crate::TRANSFER_ID_MODULO, tolerance),
            current: None,
        }
    }

    /// Feeds one frame (tail byte already split off) into the slot
    ///
    /// `extent` is the largest reassembled payload the listeners accept, not
    /// counting the transfer CRC.
    pub fn update(
        &mut self,
        tail: TailByte,
        data: &[u8],
        timestamp: Timestamp,
        extent: usize,
        gap_timeout: Duration,
    ) -> SessionOutcome {
        // Discard a stale partial transfer before looking at the frame
        if let Some(buildup) = &self.current {
            let age = timestamp
                .monotonic
                .saturating_duration_since(buildup.first_frame.monotonic);
            if age > gap_timeout {
                self.current = None;
                self.tracker.reset();
            }
        }

        match &mut self.current {
            Some(buildup) if buildup.transfer_id == tail.transfer_id => {
                if tail.start || tail.toggle != buildup.expected_toggle {
                    self.current = None;
                    return SessionOutcome::Rejected(ReassemblyError::ToggleMismatch);
                }
                if buildup.payload.len() + data.len() > extent + 2 {
                    self.current = None;
                    return SessionOutcome::Rejected(ReassemblyError::ExtentExceeded);
                }
                buildup.payload.extend_from_slice(data);
                buildup.frames += 1;
                buildup.expected_toggle = !buildup.expected_toggle;
                if tail.end {
                    let buildup = self.current.take().expect("Bug: buildup vanished");
                    self.finish(buildup)
                } else {
                    SessionOutcome::InProgress
                }
            }
            Some(_) => {
                // A frame from some other transfer; let the one in progress
                // finish unless this is a fresh start that supersedes it.
                if tail.start {
                    self.current = None;
                    self.begin(tail, data, timestamp, extent)
                } else {
                    SessionOutcome::Ignored
                }
            }
            None => {
                if !tail.start {
                    return SessionOutcome::Rejected(ReassemblyError::MissedStart);
                }
                self.begin(tail, data, timestamp, extent)
            }
        }
    }

    fn begin(
        &mut self,
        tail: TailByte,
        data: &[u8],
        timestamp: Timestamp,
        extent: usize,
    ) -> SessionOutcome {
        // The first frame of a transfer always carries toggle = 1
        if !tail.toggle {
            return SessionOutcome::Rejected(ReassemblyError::ToggleMismatch);
        }
        if !self.tracker.accept_strict(tail.transfer_id) {
            return SessionOutcome::Rejected(ReassemblyError::TransferIdRegression);
        }
        if data.len() > extent + 2 {
            return SessionOutcome::Rejected(ReassemblyError::ExtentExceeded);
        }
        let buildup = Buildup {
            transfer_id: tail.transfer_id,
            expected_toggle: false,
            payload: data.to_vec(),
            frames: 1,
            first_frame: timestamp,
        };
        if tail.end {
            // Single-frame transfer, no CRC to check
            return SessionOutcome::Transfer {
                payload: buildup.payload,
                timestamp: buildup.first_frame,
            };
        }
        self.current = Some(buildup);
        SessionOutcome::InProgress
    }

    fn finish(&mut self, buildup: Buildup) -> SessionOutcome {
        debug_assert!(buildup.frames > 1);
        let mut crc = TransferCrc::new();
        crc.add_bytes(&buildup.payload);
        if crc.get() != 0 {
            return SessionOutcome::Rejected(ReassemblyError::CrcMismatch);
        }
        let mut payload = buildup.payload;
        payload.truncate(payload.len() - 2);
        SessionOutcome::Transfer {
            payload,
            timestamp: buildup.first_frame,
        }
    }

    /// Whether a partial transfer has outlived the gap timeout
    fn is_expired(&self, now: MonotonicTime, gap_timeout: Duration) -> bool {
        match &self.current {
            Some(buildup) => {
                now.saturating_duration_since(buildup.first_frame.monotonic) > gap_timeout
            }
            None => false,
        }
    }
}

/// What the receiver did with a frame, for statistics
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AcceptOutcome {
    /// A transfer completed and was queued on at least one session
    TransferDelivered,
    /// The frame was consumed into a partial transfer
    Consumed,
    /// The frame was not usable: malformed, foreign, or no session wants it
    Dropped,
    /// The frame damaged or aborted a reassembly
    Error(ReassemblyError),
}

/// One open input session with its queue of completed transfers
struct Subscription {
    extent: usize,
    refs: usize,
    queue: VecDeque<TransferIn>,
}

/// Demultiplexes incoming frames into per-session transfer queues
///
/// Reassembly state is keyed by `(data specifier, source)` so that a
/// promiscuous and a selective session over the same traffic share one
/// reassembler, per the session invariants.
pub(crate) struct Receiver {
    subscriptions: HashMap<InputSessionSpecifier, Subscription>,
    slots: HashMap<(DataSpecifier, NodeId), RxSlot>,
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
            // Drop reassembly slots nothing listens to anymore
            let subscriptions = &self.subscriptions;
            self.slots.retain(|(ds, source), _| {
                subscriptions
                    .iter()
                    .any(|(s, _)| s.data_specifier == *ds && s.accepts(Some(*source)))
            });
        }
    }

    pub fn is_open(&self, spec: &InputSessionSpecifier) -> bool {
        self.subscriptions.contains_key(spec)
    }

    pub fn pop(&mut self, spec: &InputSessionSpecifier) -> Option<TransferIn> {
        self.subscriptions
            .get_mut(spec)
            .and_then(|subscription| subscription.queue.pop_front())
    }

    /// Handles one incoming frame
    pub fn accept(
        &mut self,
        id: CanId,
        data: &[u8],
        timestamp: Timestamp,
        now: MonotonicTime,
    ) -> AcceptOutcome {
        self.clean_expired_slots(now);

        let routing = match parse_can_id(id) {
            Ok(routing) => routing,
            Err(_) => return AcceptOutcome::Dropped,
        };
        let (&tail_bits, payload) = match data.split_last() {
            Some(split) => split,
            None => return AcceptOutcome::Dropped,
        };
        let tail = TailByte::parse(tail_bits);

        if let Some(destination) = routing.destination {
            // A service transfer going to some other node
            if Some(destination) != self.local_node {
                return AcceptOutcome::Dropped;
            }
        }

        let wanted = self.max_extent(&routing);
        let extent = match wanted {
            Some(extent) => extent,
            None => return AcceptOutcome::Dropped,
        };

        match routing.source {
            None => {
                // Anonymous transfers must fit into a single frame
                if !(tail.start && tail.end && tail.toggle) {
                    return AcceptOutcome::Error(ReassemblyError::AnonymousMultiFrame);
                }
                if payload.len() > extent {
                    return AcceptOutcome::Error(ReassemblyError::ExtentExceeded);
                }
                let transfer = TransferIn {
                    timestamp,
                    priority: routing.priority,
                    transfer_id: tail.transfer_id,
                    source: None,
                    payload: payload.to_vec(),
                };
                self.deliver(&routing, transfer)
            }
            Some(source) => {
                let tolerance = self.tolerance;
                let gap_timeout = self.gap_timeout;
                let slot = self
                    .slots
                    .entry((routing.data_specifier, source))
                    .or_insert_with(|| RxSlot::new(tolerance));
                match slot.update(tail, payload, timestamp, extent, gap_timeout) {
                    SessionOutcome::Transfer { payload, timestamp } => {
                        let transfer = TransferIn {
                            timestamp,
                            priority: routing.priority,
                            transfer_id: tail.transfer_id,
                            source: Some(source),
                            payload,
                        };
                        self.deliver(&routing, transfer)
                    }
                    SessionOutcome::InProgress => AcceptOutcome::Consumed,
                    SessionOutcome::Ignored => AcceptOutcome::Dropped,
                    SessionOutcome::Rejected(error) => AcceptOutcome::Error(error),
                }
            }
        }
    }

    /// Queues a completed transfer on every session that wants it
    fn deliver(&mut self, routing: &CanRouting, transfer: TransferIn) -> AcceptOutcome {
        let mut delivered = false;
        for (spec, subscription) in self.subscriptions.iter_mut() {
            if spec.data_specifier == routing.data_specifier && spec.accepts(routing.source) {
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

    /// The largest extent among sessions interested in this traffic
    fn max_extent(&self, routing: &CanRouting) -> Option<usize> {
        self.subscriptions
            .iter()
            .filter(|(spec, _)| {
                spec.data_specifier == routing.data_specifier && spec.accepts(routing.source)
            })
            .map(|(_, subscription)| subscription.extent)
            .max()
    }

    pub fn clean_expired_slots(&mut self, now: MonotonicTime) {
        let gap_timeout = self.gap_timeout;
        for slot in self.slots.values_mut() {
            if slot.is_expired(now, gap_timeout) {
                slot.current = None;
                slot.tracker.reset();
            }
        }
    }

    /// The acceptance filters covering the current subscriptions
    pub fn filters(&self) -> Vec<crate::filter::Filter> {
        use crate::filter;
        self.subscriptions
            .keys()
            .filter_map(|spec| match spec.data_specifier {
                DataSpecifier::Subject(subject) => Some(filter::subject_filter(subject)),
                DataSpecifier::ServiceRequest(service) => self
                    .local_node
                    .map(|node| filter::request_filter(service, node)),
                DataSpecifier::ServiceResponse(service) => self
                    .local_node
                    .map(|node| filter::response_filter(service, node)),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.slots.clear();
    }
}

/// Basic extension trait for extracting bits from a CAN ID
pub(crate) trait GetBits {
    fn bit_set(self, offset: u32) -> bool;
    fn get_u8(self, offset: u32) -> u8;
    fn get_u16(self, offset: u32) -> u16;
}

impl GetBits for u32 {
    fn bit_set(self, offset: u32) -> bool {
        ((self >> offset) & 1) == 1
    }
    fn get_u8(self, offset: u32) -> u8 {
        (self >> offset) as u8
    }
    fn get_u16(self, offset: u32) -> u16 {
        (self >> offset) as u16
    }
}
impl GetBits for u8 {
    fn bit_set(self, offset: u32) -> bool {
        ((self >> offset) & 1) == 1
    }
    fn get_u8(self, offset: u32) -> u8 {
        self >> offset
    }
    fn get_u16(self, offset: u32) -> u16 {
        u16::from(self.get_u8(offset))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryFrom as _;
    use std::time::Duration;

    fn can_id(bits: u32) -> CanId {
        CanId::try_from(bits).unwrap()
    }

    #[test]
    fn test_parse_can_id() {
        // Examples from the Cyphal/CAN specification
        // Heartbeat
        check_can_id(
            CanRouting {
                source: Some(NodeId::new(42)),
                priority: Priority::Nominal,
                data_specifier: DataSpecifier::Subject(SubjectId::try_from(7509).unwrap()),
                destination: None,
            },
            0x107d552a,
        );
        // Anonymous string primitive
        check_can_id(
            CanRouting {
                source: None,
                priority: Priority::Nominal,
                data_specifier: DataSpecifier::Subject(SubjectId::try_from(4919).unwrap()),
                destination: None,
            },
            0x11733775,
        );
        // Node info request
        check_can_id(
            CanRouting {
                source: Some(NodeId::new(123)),
                priority: Priority::Nominal,
                data_specifier: DataSpecifier::ServiceRequest(ServiceId::try_from(430).unwrap()),
                destination: Some(NodeId::new(42)),
            },
            0x136b957b,
        );
        // Node info response
        check_can_id(
            CanRouting {
                source: Some(NodeId::new(42)),
                priority: Priority::Nominal,
                data_specifier: DataSpecifier::ServiceResponse(ServiceId::try_from(430).unwrap()),
                destination: Some(NodeId::new(123)),
            },
            0x126bbdaa,
        );
    }

    fn check_can_id(expected: CanRouting, bits: u32) {
        let actual = parse_can_id(can_id(bits)).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn reserved_bit_23_rejected() {
        assert!(parse_can_id(can_id(0x107d552a | (1 << 23))).is_err());
    }

    fn receiver_for_subject(subject: u16) -> (Receiver, InputSessionSpecifier) {
        let mut receiver = Receiver::new(Some(NodeId::new(1)), Duration::from_secs(2), 16);
        let spec = InputSessionSpecifier::promiscuous(DataSpecifier::Subject(
            SubjectId::try_from(subject).unwrap(),
        ));
        receiver.open(&spec, 64);
        (receiver, spec)
    }

    #[test]
    fn single_frame_message() {
        let (mut receiver, spec) = receiver_for_subject(1234);
        let id = can_id((4 << 26) | (3 << 21) | (1234 << 8) | 42);
        let tail = TailByte {
            start: true,
            end: true,
            toggle: true,
            transfer_id: TransferId::new(0),
        };
        let now = MonotonicTime::now();
        let outcome = receiver.accept(
            id,
            &[1, 2, 3, 4, tail.encode()],
            Timestamp::now(),
            now,
        );
        assert_eq!(outcome, AcceptOutcome::TransferDelivered);
        let transfer = receiver.pop(&spec).unwrap();
        assert_eq!(transfer.payload, vec![1, 2, 3, 4]);
        assert_eq!(transfer.source, Some(NodeId::new(42)));
        assert_eq!(transfer.transfer_id, TransferId::new(0));
    }

    #[test]
    fn multi_frame_crc_checked() {
        let (mut receiver, spec) = receiver_for_subject(1234);
        let id = can_id((4 << 26) | (3 << 21) | (1234 << 8) | 42);
        let payload: Vec<u8> = (0..12).collect();
        let mut crc = TransferCrc::new();
        crc.add_bytes(&payload);
        let crc_value = crc.get();

        let now = MonotonicTime::now();
        let ts = Timestamp::now();
        // 7 bytes, then 5 bytes + 2 CRC bytes
        let mut first = payload[..7].to_vec();
        first.push(0b1010_0000 | 3); // start, toggle, transfer 3
        assert_eq!(
            receiver.accept(id, &first, ts, now),
            AcceptOutcome::Consumed
        );
        let mut second = payload[7..].to_vec();
        second.push((crc_value >> 8) as u8);
        second.push(crc_value as u8);
        second.push(0b0100_0000 | 3); // end, toggle 0
        assert_eq!(
            receiver.accept(id, &second, ts, now),
            AcceptOutcome::TransferDelivered
        );
        let transfer = receiver.pop(&spec).unwrap();
        assert_eq!(transfer.payload, payload);
    }

    #[test]
    fn toggle_mismatch_discards() {
        let (mut receiver, spec) = receiver_for_subject(1234);
        let id = can_id((4 << 26) | (3 << 21) | (1234 << 8) | 42);
        let now = MonotonicTime::now();
        let ts = Timestamp::now();
        assert_eq!(
            receiver.accept(id, &[0, 0, 0, 0, 0, 0, 0, 0b1010_0000], ts, now),
            AcceptOutcome::Consumed
        );
        // Second frame repeats toggle = 1 instead of alternating
        assert_eq!(
            receiver.accept(id, &[1, 1, 0b0110_0000], ts, now),
            AcceptOutcome::Error(ReassemblyError::ToggleMismatch)
        );
        assert!(receiver.pop(&spec).is_none());
    }

    #[test]
    fn old_transfer_id_rejected() {
        let (mut receiver, spec) = receiver_for_subject(1234);
        let id = can_id((4 << 26) | (3 << 21) | (1234 << 8) | 42);
        let now = MonotonicTime::now();
        let ts = Timestamp::now();
        let single = |tid: u8| vec![9u8, 0b1110_0000 | tid];
        assert_eq!(
            receiver.accept(id, &single(5), ts, now),
            AcceptOutcome::TransferDelivered
        );
        assert_eq!(
            receiver.accept(id, &single(4), ts, now),
            AcceptOutcome::Error(ReassemblyError::TransferIdRegression)
        );
        assert_eq!(
            receiver.accept(id, &single(6), ts, now),
            AcceptOutcome::TransferDelivered
        );
        assert!(receiver.pop(&spec).is_some());
        assert!(receiver.pop(&spec).is_some());
        assert!(receiver.pop(&spec).is_none());
    }

    #[test]
    fn foreign_service_destination_dropped() {
        let mut receiver = Receiver::new(Some(NodeId::new(1)), Duration::from_secs(2), 16);
        let spec = InputSessionSpecifier::promiscuous(DataSpecifier::ServiceRequest(
            ServiceId::try_from(430).unwrap(),
        ));
        receiver.open(&spec, 64);
        // Request for node 42, but we are node 1
        let id = can_id(0x136b957b);
        let outcome = receiver.accept(
            id,
            &[0, 0b1110_0000],
            Timestamp::now(),
            MonotonicTime::now(),
        );
        assert_eq!(outcome, AcceptOutcome::Dropped);
    }
}
