//!
//! The Cyphal/UDP transport layer
//!
//! Every subject is carried by its own multicast group; every node has a
//! service group for the exchanges addressed to it. Frames are datagrams with
//! the common 24-byte header in front, and a transfer may span several
//! datagrams with out-of-order arrival tolerated.
//!

pub mod address;
pub mod driver;

mod rx;
mod trace;

pub use crate::driver::{UdpDriver, UdpSocketDriver};
pub use crate::trace::UdpTracer;

use std::collections::HashMap;
use std::time::Duration;

use crc_any::CRCu32;

use bernicla_core::error::{Error, Result};
use bernicla_core::time::{MonotonicTime, Timestamp, POLL_QUANTUM};
use bernicla_core::trace::{Capture, CaptureHandler, CapturedFrame, Direction, Tracer};
use bernicla_core::transfer::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, SpoofTransfer, TransferIn,
    TransferOut,
};
use bernicla_core::transport::{ProtocolParameters, Transport, TransportStatistics};
use bernicla_core::{NodeId, Priority, SubjectId, TransferId};
use bernicla_header::FrameHeader;

/// Transfer IDs use the full 64-bit range (modulo 0 by the core convention)
pub const TRANSFER_ID_MODULO: u64 = 0;

/// The largest valid UDP node ID (0xffff is the anonymous/broadcast sentinel)
pub const MAX_NODE_ID: u16 = 0xfffe;

/// Default payload bytes per datagram
pub const DEFAULT_MTU: usize = 1408;

pub(crate) const TRACER_EXTENT: usize = 1 << 20;

/// Tuning knobs of the UDP transport
#[derive(Debug, Clone)]
pub struct UdpTransportOptions {
    /// Payload bytes per datagram
    pub mtu: usize,
    /// Partial transfers older than this are discarded
    pub gap_timeout: Duration,
    /// Transfer-ID regression tolerance
    pub transfer_id_tolerance: u64,
    /// Compatibility switch: treat a source node ID of 0 as anonymous, the
    /// way historical stacks did
    pub legacy_anonymous_zero: bool,
}

impl Default for UdpTransportOptions {
    fn default() -> Self {
        UdpTransportOptions {
            mtu: DEFAULT_MTU,
            gap_timeout: Duration::from_secs(2),
            transfer_id_tolerance: u64::MAX / 2,
            legacy_anonymous_zero: false,
        }
    }
}

/// The Cyphal/UDP transport
pub struct UdpTransport {
    driver: Box<dyn UdpDriver>,
    local_node: Option<NodeId>,
    receiver: rx::Receiver,
    output_refs: HashMap<OutputSessionSpecifier, usize>,
    /// Subjects whose multicast group the driver has joined, with session counts
    joined_subjects: HashMap<SubjectId, usize>,
    /// Number of service input sessions keeping the service group joined
    service_joins: usize,
    capture: Option<CaptureHandler>,
    statistics: TransportStatistics,
    options: UdpTransportOptions,
    closed: bool,
}

impl UdpTransport {
    pub fn new(
        driver: Box<dyn UdpDriver>,
        local_node: Option<NodeId>,
        options: UdpTransportOptions,
    ) -> Result<Self> {
        if let Some(node) = local_node {
            if u16::from(node) > MAX_NODE_ID {
                return Err(Error::InvalidTransportConfiguration(format!(
                    "node ID {} exceeds the UDP maximum of {}",
                    node, MAX_NODE_ID
                )));
            }
        }
        if options.mtu == 0 {
            return Err(Error::InvalidTransportConfiguration(
                "the MTU must carry at least one payload byte".into(),
            ));
        }
        let receiver = rx::Receiver::new(
            local_node,
            options.gap_timeout,
            options.transfer_id_tolerance,
            options.legacy_anonymous_zero,
        );
        Ok(UdpTransport {
            driver,
            local_node,
            receiver,
            output_refs: HashMap::new(),
            joined_subjects: HashMap::new(),
            service_joins: 0,
            capture: None,
            statistics: TransportStatistics::default(),
            options,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ResourceClosed)
        } else {
            Ok(())
        }
    }

    /// Splits a transfer into datagrams ready for the wire
    fn build_datagrams(
        &self,
        priority: Priority,
        source: Option<NodeId>,
        destination: Option<NodeId>,
        data_specifier: DataSpecifier,
        transfer_id: TransferId,
        payload: &[u8],
    ) -> Vec<Vec<u8>> {
        let mtu = self.options.mtu;
        let header = |frame_index: u32, end_of_transfer: bool| FrameHeader {
            priority,
            source,
            destination,
            data_specifier,
            transfer_id,
            frame_index,
            end_of_transfer,
        };
        if payload.len() <= mtu {
            let mut datagram = Vec::with_capacity(bernicla_header::SIZE + payload.len());
            datagram.extend_from_slice(&header(0, true).encode());
            datagram.extend_from_slice(payload);
            return vec![datagram];
        }
        // Multi-frame: the transfer CRC rides at the end of the last frame
        let mut crc = CRCu32::crc32c();
        crc.digest(payload);
        let mut body = payload.to_vec();
        body.extend_from_slice(&crc.get_crc().to_le_bytes());

        let chunks: Vec<&[u8]> = body.chunks(mtu).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let mut datagram = Vec::with_capacity(bernicla_header::SIZE + chunk.len());
                datagram.extend_from_slice(&header(index as u32, index == last).encode());
                datagram.extend_from_slice(chunk);
                datagram
            })
            .collect()
    }

    fn submit_datagrams(
        &mut self,
        endpoint: std::net::SocketAddrV4,
        datagrams: Vec<Vec<u8>>,
        deadline: MonotonicTime,
    ) -> Result<()> {
        for datagram in &datagrams {
            match self.driver.send(endpoint, datagram, deadline) {
                Ok(()) => {}
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(Error::Io(io)) => {
                    log::error!("UDP media failed, closing transport: {}", io);
                    self.close();
                    return Err(Error::SendFailed(io.to_string()));
                }
                Err(other) => return Err(other),
            }
            if let Some(handler) = &mut self.capture {
                handler(&Capture {
                    timestamp: Timestamp::now(),
                    direction: Direction::Tx,
                    frame: CapturedFrame::Udp {
                        datagram: datagram.clone(),
                    },
                });
            }
            self.statistics.frames_sent += 1;
        }
        self.statistics.transfers_sent += 1;
        Ok(())
    }

    fn process_datagram(&mut self, datagram: Vec<u8>, timestamp: Timestamp) {
        self.statistics.frames_received += 1;
        if let Some(handler) = &mut self.capture {
            handler(&Capture {
                timestamp,
                direction: Direction::Rx,
                frame: CapturedFrame::Udp {
                    datagram: datagram.clone(),
                },
            });
        }
        match self.receiver.accept(&datagram, timestamp) {
            rx::AcceptOutcome::TransferDelivered => self.statistics.transfers_received += 1,
            rx::AcceptOutcome::Consumed => {}
            rx::AcceptOutcome::Dropped => self.statistics.frames_dropped += 1,
            rx::AcceptOutcome::Error(error) => {
                log::warn!("UDP reassembly error: {}", error);
                self.statistics.reassembly_errors += 1;
            }
        }
    }

    fn pump(&mut self, deadline: MonotonicTime) -> Result<()> {
        let slice = (MonotonicTime::now() + POLL_QUANTUM).min(deadline);
        match self.driver.receive(slice) {
            Ok(Some((datagram, timestamp))) => {
                self.process_datagram(datagram, timestamp);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                log::error!("UDP media failed, closing transport: {}", error);
                self.close();
                Err(error)
            }
        }
    }

    fn validate_output(&self, spec: &OutputSessionSpecifier) -> Result<()> {
        address::output_endpoint(spec)?;
        if spec.data_specifier.is_service() && self.local_node.is_none() {
            return Err(Error::InvalidTransportConfiguration(
                "anonymous nodes cannot take part in service exchanges".into(),
            ));
        }
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: TRANSFER_ID_MODULO,
            max_node_id: MAX_NODE_ID,
            mtu: self.options.mtu,
        }
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.local_node
    }

    fn open_output(&mut self, spec: &OutputSessionSpecifier) -> Result<()> {
        self.check_open()?;
        self.validate_output(spec)?;
        *self.output_refs.entry(*spec).or_insert(0) += 1;
        Ok(())
    }

    fn close_output(&mut self, spec: &OutputSessionSpecifier) {
        if let Some(refs) = self.output_refs.get_mut(spec) {
            *refs -= 1;
            if *refs == 0 {
                self.output_refs.remove(spec);
            }
        }
    }

    fn send(&mut self, spec: &OutputSessionSpecifier, transfer: TransferOut) -> Result<()> {
        self.check_open()?;
        self.validate_output(spec)?;
        if self.local_node.is_none() && transfer.payload.len() > self.options.mtu {
            // Anonymous transfers must fit into a single frame
            return Err(Error::PayloadTooLarge {
                size: transfer.payload.len(),
                max: self.options.mtu,
            });
        }
        let endpoint = address::output_endpoint(spec)?;
        let datagrams = self.build_datagrams(
            transfer.priority,
            self.local_node,
            spec.destination,
            spec.data_specifier,
            transfer.transfer_id,
            &transfer.payload,
        );
        self.submit_datagrams(endpoint, datagrams, transfer.deadline)
    }

    fn open_input(&mut self, spec: &InputSessionSpecifier, extent: usize) -> Result<()> {
        self.check_open()?;
        match spec.data_specifier {
            DataSpecifier::Subject(subject) => {
                let joins = self.joined_subjects.entry(subject).or_insert(0);
                if *joins == 0 {
                    self.driver.join(address::subject_group(subject))?;
                }
                *joins += 1;
            }
            DataSpecifier::ServiceRequest(_) | DataSpecifier::ServiceResponse(_) => {
                let local = self.local_node.ok_or_else(|| {
                    Error::InvalidTransportConfiguration(
                        "anonymous nodes cannot take part in service exchanges".into(),
                    )
                })?;
                if self.service_joins == 0 {
                    self.driver.join(address::service_group(local))?;
                }
                self.service_joins += 1;
            }
        }
        self.receiver.open(spec, extent);
        Ok(())
    }

    fn close_input(&mut self, spec: &InputSessionSpecifier) {
        if !self.receiver.close(spec) {
            return;
        }
        match spec.data_specifier {
            DataSpecifier::Subject(subject) => {
                if let Some(joins) = self.joined_subjects.get_mut(&subject) {
                    *joins -= 1;
                    if *joins == 0 && !self.receiver.subject_still_wanted(&spec.data_specifier) {
                        self.driver.leave(address::subject_group(subject));
                        self.joined_subjects.remove(&subject);
                    }
                }
            }
            DataSpecifier::ServiceRequest(_) | DataSpecifier::ServiceResponse(_) => {
                self.service_joins = self.service_joins.saturating_sub(1);
                if self.service_joins == 0 {
                    if let Some(local) = self.local_node {
                        self.driver.leave(address::service_group(local));
                    }
                }
            }
        }
    }

    fn receive(
        &mut self,
        spec: &InputSessionSpecifier,
        deadline: MonotonicTime,
    ) -> Result<Option<TransferIn>> {
        loop {
            self.check_open()?;
            if let Some(transfer) = self.receiver.pop(spec) {
                return Ok(Some(transfer));
            }
            self.pump(deadline)?;
            if let Some(transfer) = self.receiver.pop(spec) {
                return Ok(Some(transfer));
            }
            if MonotonicTime::now() >= deadline {
                self.receiver.clean_expired(MonotonicTime::now());
                return Ok(None);
            }
        }
    }

    fn poll(&mut self, deadline: MonotonicTime) -> Result<()> {
        loop {
            self.check_open()?;
            self.pump(deadline)?;
            if MonotonicTime::now() >= deadline {
                self.receiver.clean_expired(MonotonicTime::now());
                return Ok(());
            }
        }
    }

    fn spoof(&mut self, transfer: SpoofTransfer, deadline: MonotonicTime) -> Result<()> {
        self.check_open()?;
        if transfer.source.is_none() && transfer.payload.len() > self.options.mtu {
            return Err(Error::PayloadTooLarge {
                size: transfer.payload.len(),
                max: self.options.mtu,
            });
        }
        let endpoint = match (&transfer.data_specifier, transfer.destination) {
            (DataSpecifier::Subject(subject), _) => address::subject_group(*subject),
            (_, Some(destination)) => address::service_group(destination),
            (_, None) => {
                return Err(Error::InvalidTransportConfiguration(
                    "service spoofs require a destination node".into(),
                ))
            }
        };
        let datagrams = self.build_datagrams(
            transfer.priority,
            transfer.source,
            transfer.destination,
            transfer.data_specifier,
            transfer.transfer_id,
            &transfer.payload,
        );
        self.submit_datagrams(endpoint, datagrams, deadline)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        self.capture = Some(handler);
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(UdpTracer::new(
            self.options.gap_timeout,
            self.options.transfer_id_tolerance,
        ))
    }

    fn statistics(&self) -> TransportStatistics {
        self.statistics
    }

    fn close(&mut self) {
        if !self.closed {
            self.driver.close();
            self.receiver.clear();
            self.output_refs.clear();
            self.joined_subjects.clear();
            self.service_joins = 0;
            self.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::convert::TryFrom;
    use std::net::SocketAddrV4;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// An in-memory pipe standing in for the network
    #[derive(Default)]
    struct PipeState {
        datagrams: VecDeque<Vec<u8>>,
    }

    struct PipeDriver {
        state: Rc<RefCell<PipeState>>,
    }

    impl UdpDriver for PipeDriver {
        fn send(
            &mut self,
            _destination: SocketAddrV4,
            datagram: &[u8],
            _deadline: MonotonicTime,
        ) -> Result<()> {
            self.state.borrow_mut().datagrams.push_back(datagram.to_vec());
            Ok(())
        }

        fn receive(&mut self, _deadline: MonotonicTime) -> Result<Option<(Vec<u8>, Timestamp)>> {
            Ok(self
                .state
                .borrow_mut()
                .datagrams
                .pop_front()
                .map(|datagram| (datagram, Timestamp::now())))
        }

        fn join(&mut self, _group: SocketAddrV4) -> Result<()> {
            Ok(())
        }
        fn leave(&mut self, _group: SocketAddrV4) {}
        fn close(&mut self) {}
    }

    fn looped_transport(node: u16) -> UdpTransport {
        let state = Rc::new(RefCell::new(PipeState::default()));
        UdpTransport::new(
            Box::new(PipeDriver { state }),
            Some(NodeId::new(node)),
            UdpTransportOptions::default(),
        )
        .unwrap()
    }

    fn subject_spec(subject: u16) -> (OutputSessionSpecifier, InputSessionSpecifier) {
        let subject = SubjectId::try_from(subject).unwrap();
        (
            OutputSessionSpecifier::broadcast(subject),
            InputSessionSpecifier::promiscuous(DataSpecifier::Subject(subject)),
        )
    }

    #[test]
    fn single_frame_round_trip() {
        let mut transport = looped_transport(9);
        let (out_spec, in_spec) = subject_spec(77);
        transport.open_output(&out_spec).unwrap();
        transport.open_input(&in_spec, 64).unwrap();

        let deadline = MonotonicTime::now() + Duration::from_millis(100);
        transport
            .send(
                &out_spec,
                TransferOut {
                    deadline,
                    priority: Priority::Nominal,
                    transfer_id: TransferId::new(3),
                    payload: vec![1, 2, 3],
                },
            )
            .unwrap();
        let transfer = transport.receive(&in_spec, deadline).unwrap().unwrap();
        assert_eq!(transfer.payload, vec![1, 2, 3]);
        assert_eq!(transfer.source, Some(NodeId::new(9)));
        assert_eq!(transfer.transfer_id, TransferId::new(3));
    }

    #[test]
    fn multi_frame_round_trip() {
        let mut transport = looped_transport(9);
        let (out_spec, in_spec) = subject_spec(78);
        transport.open_output(&out_spec).unwrap();
        transport.open_input(&in_spec, 8192).unwrap();

        let payload: Vec<u8> = (0..4000u32).map(|value| value as u8).collect();
        let deadline = MonotonicTime::now() + Duration::from_millis(200);
        transport
            .send(
                &out_spec,
                TransferOut {
                    deadline,
                    priority: Priority::Low,
                    transfer_id: TransferId::new(0),
                    payload: payload.clone(),
                },
            )
            .unwrap();
        let transfer = transport.receive(&in_spec, deadline).unwrap().unwrap();
        assert_eq!(transfer.payload, payload);
        assert_eq!(transfer.priority, Priority::Low);
    }

    #[test]
    fn anonymous_multi_frame_rejected() {
        let state = Rc::new(RefCell::new(PipeState::default()));
        let mut transport = UdpTransport::new(
            Box::new(PipeDriver { state }),
            None,
            UdpTransportOptions::default(),
        )
        .unwrap();
        let (out_spec, _) = subject_spec(79);
        let deadline = MonotonicTime::now() + Duration::from_millis(100);
        let result = transport.send(
            &out_spec,
            TransferOut {
                deadline,
                priority: Priority::Nominal,
                transfer_id: TransferId::new(0),
                payload: vec![0; DEFAULT_MTU + 1],
            },
        );
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }
}
