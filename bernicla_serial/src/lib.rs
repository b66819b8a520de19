//!
//! The Cyphal/serial transport layer
//!
//! A raw byte stream carries COBS-delimited frames, each with the common
//! 24-byte header in front. The link preserves ordering, so multi-frame
//! reassembly is strictly sequential.
//!

pub mod driver;

mod framing;
mod rx;
mod trace;

pub use crate::driver::{SerialDriver, TcpTunnelDriver};
#[cfg(unix)]
pub use crate::driver::PosixSerialDriver;
pub use crate::trace::SerialTracer;

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
use bernicla_core::{NodeId, Priority, TransferId};
use bernicla_header::FrameHeader;

/// Transfer IDs use the full 64-bit range (modulo 0 by the core convention)
pub const TRANSFER_ID_MODULO: u64 = 0;

/// The largest valid serial node ID (0xffff is the anonymous/broadcast sentinel)
pub const MAX_NODE_ID: u16 = 0xfffe;

/// Default payload bytes per frame
pub const DEFAULT_MTU: usize = 1024;

pub(crate) const TRACER_EXTENT: usize = 1 << 20;

/// Tuning knobs of the serial transport
#[derive(Debug, Clone)]
pub struct SerialTransportOptions {
    /// Payload bytes per frame
    pub mtu: usize,
    /// Partial transfers older than this are discarded
    pub gap_timeout: Duration,
    /// Transfer-ID regression tolerance
    pub transfer_id_tolerance: u64,
}

impl Default for SerialTransportOptions {
    fn default() -> Self {
        SerialTransportOptions {
            mtu: DEFAULT_MTU,
            gap_timeout: Duration::from_secs(2),
            transfer_id_tolerance: u64::MAX / 2,
        }
    }
}

/// The Cyphal/serial transport
pub struct SerialTransport {
    driver: Box<dyn SerialDriver>,
    local_node: Option<NodeId>,
    receiver: rx::Receiver,
    deframer: framing::Deframer,
    output_refs: HashMap<OutputSessionSpecifier, usize>,
    capture: Option<CaptureHandler>,
    statistics: TransportStatistics,
    options: SerialTransportOptions,
    closed: bool,
}

impl SerialTransport {
    pub fn new(
        driver: Box<dyn SerialDriver>,
        local_node: Option<NodeId>,
        options: SerialTransportOptions,
    ) -> Result<Self> {
        if let Some(node) = local_node {
            if u16::from(node) > MAX_NODE_ID {
                return Err(Error::InvalidTransportConfiguration(format!(
                    "node ID {} exceeds the serial maximum of {}",
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
        );
        Ok(SerialTransport {
            driver,
            local_node,
            receiver,
            deframer: framing::Deframer::new(),
            output_refs: HashMap::new(),
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

    fn validate_output(&self, spec: &OutputSessionSpecifier) -> Result<()> {
        match spec.data_specifier {
            DataSpecifier::Subject(_) => {
                if spec.destination.is_some() {
                    return Err(Error::InvalidTransportConfiguration(
                        "message outputs broadcast and take no destination".into(),
                    ));
                }
            }
            DataSpecifier::ServiceRequest(_) | DataSpecifier::ServiceResponse(_) => {
                if spec.destination.is_none() {
                    return Err(Error::InvalidTransportConfiguration(
                        "service outputs require a destination node".into(),
                    ));
                }
                if self.local_node.is_none() {
                    return Err(Error::InvalidTransportConfiguration(
                        "anonymous nodes cannot take part in service exchanges".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Splits a transfer into COBS-framed wire chunks plus their decoded form
    /// for capture
    fn build_frames(
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
            let mut frame = Vec::with_capacity(bernicla_header::SIZE + payload.len());
            frame.extend_from_slice(&header(0, true).encode());
            frame.extend_from_slice(payload);
            return vec![frame];
        }
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
                let mut frame = Vec::with_capacity(bernicla_header::SIZE + chunk.len());
                frame.extend_from_slice(&header(index as u32, index == last).encode());
                frame.extend_from_slice(chunk);
                frame
            })
            .collect()
    }

    fn submit_frames(&mut self, frames: Vec<Vec<u8>>, deadline: MonotonicTime) -> Result<()> {
        for frame in &frames {
            let wire = framing::encode_frame(frame);
            match self.driver.send(&wire, deadline) {
                Ok(()) => {}
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(Error::Io(io)) => {
                    log::error!("serial media failed, closing transport: {}", io);
                    self.close();
                    return Err(Error::SendFailed(io.to_string()));
                }
                Err(other) => return Err(other),
            }
            if let Some(handler) = &mut self.capture {
                handler(&Capture {
                    timestamp: Timestamp::now(),
                    direction: Direction::Tx,
                    frame: CapturedFrame::Serial {
                        frame: frame.clone(),
                    },
                });
            }
            self.statistics.frames_sent += 1;
        }
        self.statistics.transfers_sent += 1;
        Ok(())
    }

    fn process_frame(&mut self, frame: Vec<u8>, timestamp: Timestamp) {
        self.statistics.frames_received += 1;
        if let Some(handler) = &mut self.capture {
            handler(&Capture {
                timestamp,
                direction: Direction::Rx,
                frame: CapturedFrame::Serial {
                    frame: frame.clone(),
                },
            });
        }
        match self.receiver.accept(&frame, timestamp) {
            rx::AcceptOutcome::TransferDelivered => self.statistics.transfers_received += 1,
            rx::AcceptOutcome::Consumed => {}
            rx::AcceptOutcome::Dropped => self.statistics.frames_dropped += 1,
            rx::AcceptOutcome::Error(error) => {
                log::warn!("serial reassembly error: {}", error);
                self.statistics.reassembly_errors += 1;
            }
        }
    }

    fn pump(&mut self, deadline: MonotonicTime) -> Result<()> {
        let slice = (MonotonicTime::now() + POLL_QUANTUM).min(deadline);
        let mut buffer = [0u8; 4096];
        let count = match self.driver.receive(&mut buffer, slice) {
            Ok(count) => count,
            Err(error) => {
                log::error!("serial media failed, closing transport: {}", error);
                self.close();
                return Err(error);
            }
        };
        if count == 0 {
            return Ok(());
        }
        let timestamp = Timestamp::now();
        for decoded in self.deframer.feed(&buffer[..count]) {
            match decoded {
                Ok(frame) => self.process_frame(frame, timestamp),
                Err(()) => {
                    log::warn!("serial framing error, discarding segment");
                    self.statistics.reassembly_errors += 1;
                }
            }
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
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
        let frames = self.build_frames(
            transfer.priority,
            self.local_node,
            spec.destination,
            spec.data_specifier,
            transfer.transfer_id,
            &transfer.payload,
        );
        self.submit_frames(frames, transfer.deadline)
    }

    fn open_input(&mut self, spec: &InputSessionSpecifier, extent: usize) -> Result<()> {
        self.check_open()?;
        if spec.data_specifier.is_service() && self.local_node.is_none() {
            return Err(Error::InvalidTransportConfiguration(
                "anonymous nodes cannot take part in service exchanges".into(),
            ));
        }
        self.receiver.open(spec, extent);
        Ok(())
    }

    fn close_input(&mut self, spec: &InputSessionSpecifier) {
        self.receiver.close(spec);
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
        if transfer.data_specifier.is_service() && transfer.destination.is_none() {
            return Err(Error::InvalidTransportConfiguration(
                "service spoofs require a destination node".into(),
            ));
        }
        let frames = self.build_frames(
            transfer.priority,
            transfer.source,
            transfer.destination,
            transfer.data_specifier,
            transfer.transfer_id,
            &transfer.payload,
        );
        self.submit_frames(frames, deadline)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        self.capture = Some(handler);
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(SerialTracer::new(
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
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::convert::TryFrom;
    use std::rc::Rc;

    use bernicla_core::SubjectId;

    /// An in-memory byte pipe standing in for the line
    #[derive(Default)]
    struct PipeState {
        bytes: VecDeque<u8>,
    }

    struct PipeDriver {
        state: Rc<RefCell<PipeState>>,
    }

    impl SerialDriver for PipeDriver {
        fn send(&mut self, bytes: &[u8], _deadline: MonotonicTime) -> Result<()> {
            self.state.borrow_mut().bytes.extend(bytes.iter().copied());
            Ok(())
        }

        fn receive(&mut self, buffer: &mut [u8], _deadline: MonotonicTime) -> Result<usize> {
            let mut state = self.state.borrow_mut();
            let mut count = 0;
            while count < buffer.len() {
                match state.bytes.pop_front() {
                    Some(byte) => {
                        buffer[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }

        fn close(&mut self) {}
    }

    fn looped_transport(node: u16) -> SerialTransport {
        let state = Rc::new(RefCell::new(PipeState::default()));
        SerialTransport::new(
            Box::new(PipeDriver { state }),
            Some(NodeId::new(node)),
            SerialTransportOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn multi_frame_round_trip() {
        let mut transport = looped_transport(3);
        let subject = SubjectId::try_from(500).unwrap();
        let out_spec = OutputSessionSpecifier::broadcast(subject);
        let in_spec = InputSessionSpecifier::promiscuous(DataSpecifier::Subject(subject));
        transport.open_output(&out_spec).unwrap();
        transport.open_input(&in_spec, 8192).unwrap();

        let payload: Vec<u8> = (0..3000u32).map(|value| value as u8).collect();
        let deadline = MonotonicTime::now() + Duration::from_millis(200);
        transport
            .send(
                &out_spec,
                TransferOut {
                    deadline,
                    priority: Priority::Nominal,
                    transfer_id: TransferId::new(7),
                    payload: payload.clone(),
                },
            )
            .unwrap();
        let transfer = transport.receive(&in_spec, deadline).unwrap().unwrap();
        assert_eq!(transfer.payload, payload);
        assert_eq!(transfer.transfer_id, TransferId::new(7));
        assert_eq!(transfer.source, Some(NodeId::new(3)));
    }

    #[test]
    fn payload_with_delimiter_bytes_survives_framing() {
        let mut transport = looped_transport(3);
        let subject = SubjectId::try_from(501).unwrap();
        let out_spec = OutputSessionSpecifier::broadcast(subject);
        let in_spec = InputSessionSpecifier::promiscuous(DataSpecifier::Subject(subject));
        transport.open_output(&out_spec).unwrap();
        transport.open_input(&in_spec, 64).unwrap();

        let payload = vec![0u8, 0, 1, 0, 2, 0];
        let deadline = MonotonicTime::now() + Duration::from_millis(100);
        transport
            .send(
                &out_spec,
                TransferOut {
                    deadline,
                    priority: Priority::Nominal,
                    transfer_id: TransferId::new(0),
                    payload: payload.clone(),
                },
            )
            .unwrap();
        let transfer = transport.receive(&in_spec, deadline).unwrap().unwrap();
        assert_eq!(transfer.payload, payload);
    }
}
