//!
//! The Cyphal/CAN transport layer (CAN 2.0 and CAN FD)
//!

pub mod data;
pub mod driver;
pub mod filter;

mod crc;
mod rx;
mod trace;
mod tx;

pub use crate::data::{CanFrame, CanId, Mtu};
pub use crate::driver::CanDriver;
pub use crate::trace::CanTracer;

use std::collections::HashMap;
use std::time::Duration;

use bernicla_core::error::{Error, Result};
use bernicla_core::time::{self, MonotonicTime, Timestamp};
use bernicla_core::trace::{Capture, CaptureHandler, CapturedFrame, Direction, Tracer};
use bernicla_core::transfer::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, SpoofTransfer, TransferIn,
    TransferOut,
};
use bernicla_core::transport::{ProtocolParameters, Transport, TransportStatistics};
use bernicla_core::{NodeId, TransferId};

/// Transfer IDs on CAN are 5 bits wide
pub const TRANSFER_ID_MODULO: u64 = 32;

/// The largest valid CAN node ID
pub const MAX_NODE_ID: u16 = 127;

/// Payload ceiling used by tracers, which have no subscriptions to size
/// buffers from
pub(crate) const TRACER_EXTENT: usize = 1 << 20;

/// Tuning knobs of the CAN transport
#[derive(Debug, Clone)]
pub struct CanTransportOptions {
    /// Partial transfers older than this are discarded
    pub gap_timeout: Duration,
    /// How far behind the last accepted transfer ID a frame may claim to be
    /// before it is rejected as a replay
    pub transfer_id_tolerance: u64,
    /// Number of hardware/kernel acceptance filter slots, if limited
    pub filter_slots: Option<usize>,
}

impl Default for CanTransportOptions {
    fn default() -> Self {
        CanTransportOptions {
            gap_timeout: Duration::from_secs(2),
            transfer_id_tolerance: TRANSFER_ID_MODULO / 2,
            filter_slots: None,
        }
    }
}

/// The Cyphal/CAN transport
pub struct CanTransport {
    driver: Box<dyn CanDriver>,
    local_node: Option<NodeId>,
    receiver: rx::Receiver,
    output_refs: HashMap<OutputSessionSpecifier, usize>,
    capture: Option<CaptureHandler>,
    statistics: TransportStatistics,
    options: CanTransportOptions,
    closed: bool,
}

impl CanTransport {
    pub fn new(
        driver: Box<dyn CanDriver>,
        local_node: Option<NodeId>,
        options: CanTransportOptions,
    ) -> Result<Self> {
        if let Some(node) = local_node {
            if u16::from(node) > MAX_NODE_ID {
                return Err(Error::InvalidTransportConfiguration(format!(
                    "node ID {} exceeds the CAN maximum of {}",
                    node, MAX_NODE_ID
                )));
            }
        }
        let receiver = rx::Receiver::new(
            local_node,
            options.gap_timeout,
            options.transfer_id_tolerance,
        );
        Ok(CanTransport {
            driver,
            local_node,
            receiver,
            output_refs: HashMap::new(),
            capture: None,
            statistics: TransportStatistics::default(),
            options,
            closed: false,
        })
    }

    /// Payload bytes per frame (the tail byte is overhead)
    fn frame_capacity(&self) -> usize {
        self.driver.mtu().as_usize() - 1
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
                match spec.destination {
                    None => {
                        return Err(Error::InvalidTransportConfiguration(
                            "service outputs require a destination node".into(),
                        ))
                    }
                    Some(destination) if u16::from(destination) > MAX_NODE_ID => {
                        return Err(Error::InvalidTransportConfiguration(format!(
                            "destination {} exceeds the CAN maximum of {}",
                            destination, MAX_NODE_ID
                        )))
                    }
                    Some(_) => {}
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

    fn emit_captures(&mut self, direction: Direction, frames: &[CanFrame]) {
        if let Some(handler) = &mut self.capture {
            let timestamp = Timestamp::now();
            for frame in frames {
                handler(&Capture {
                    timestamp,
                    direction,
                    frame: CapturedFrame::Can {
                        id: u32::from(frame.id),
                        data: frame.data.clone(),
                    },
                });
            }
        }
    }

    /// Hands frames to the media, translating failure modes
    fn submit_frames(&mut self, frames: &[CanFrame], deadline: MonotonicTime) -> Result<()> {
        match self.driver.send(frames, deadline) {
            Ok(()) => {
                self.emit_captures(Direction::Tx, frames);
                self.statistics.frames_sent += frames.len() as u64;
                self.statistics.transfers_sent += 1;
                Ok(())
            }
            Err(Error::Timeout) => Err(Error::Timeout),
            Err(Error::Io(io)) => {
                // Fatal media failure: the driver retries transient
                // conditions itself, so whatever reaches this point closes
                // the transport.
                log::error!("CAN media failed, closing transport: {}", io);
                self.close();
                Err(Error::SendFailed(io.to_string()))
            }
            Err(other) => Err(other),
        }
    }

    fn process_frame(&mut self, frame: CanFrame, timestamp: Timestamp) {
        self.statistics.frames_received += 1;
        if let Some(handler) = &mut self.capture {
            handler(&Capture {
                timestamp,
                direction: Direction::Rx,
                frame: CapturedFrame::Can {
                    id: u32::from(frame.id),
                    data: frame.data.clone(),
                },
            });
        }
        match self
            .receiver
            .accept(frame.id, &frame.data, timestamp, timestamp.monotonic)
        {
            rx::AcceptOutcome::TransferDelivered => self.statistics.transfers_received += 1,
            rx::AcceptOutcome::Consumed => {}
            rx::AcceptOutcome::Dropped => self.statistics.frames_dropped += 1,
            rx::AcceptOutcome::Error(error) => {
                log::warn!("CAN reassembly error: {}", error);
                self.statistics.reassembly_errors += 1;
            }
        }
    }

    /// One bounded wait on the media; returns whether a frame was handled
    fn pump(&mut self, deadline: MonotonicTime) -> Result<bool> {
        let now = MonotonicTime::now();
        let slice = (now + time::POLL_QUANTUM).min(deadline);
        match self.driver.receive(slice) {
            Ok(Some((frame, timestamp))) => {
                self.process_frame(frame, timestamp);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(error) => {
                log::error!("CAN media failed, closing transport: {}", error);
                self.close();
                Err(error)
            }
        }
    }

    fn update_filters(&mut self) {
        let mut filters = self.receiver.filters();
        if let Some(slots) = self.options.filter_slots {
            filter::optimize(&mut filters, slots);
        }
        if let Err(error) = self.driver.apply_filters(&filters) {
            log::warn!("acceptance filter update rejected: {}", error);
        }
    }
}

impl Transport for CanTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: TRANSFER_ID_MODULO,
            max_node_id: MAX_NODE_ID,
            mtu: self.frame_capacity(),
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
        let capacity = self.frame_capacity();
        if self.local_node.is_none() && transfer.payload.len() > capacity {
            // Anonymous transfers must fit into a single frame
            return Err(Error::PayloadTooLarge {
                size: transfer.payload.len(),
                max: capacity,
            });
        }
        let id = tx::make_can_id(
            transfer.priority,
            self.local_node,
            &spec.data_specifier,
            spec.destination,
            &transfer.payload,
        )?;
        let transfer_id = TransferId::new(transfer.transfer_id.to_u64() % TRANSFER_ID_MODULO);
        let frames =
            tx::break_into_frames(id, transfer_id, &transfer.payload, self.driver.mtu());
        self.submit_frames(&frames, transfer.deadline)
    }

    fn open_input(&mut self, spec: &InputSessionSpecifier, extent: usize) -> Result<()> {
        self.check_open()?;
        if spec.data_specifier.is_service() && self.local_node.is_none() {
            return Err(Error::InvalidTransportConfiguration(
                "anonymous nodes cannot take part in service exchanges".into(),
            ));
        }
        self.receiver.open(spec, extent);
        self.update_filters();
        Ok(())
    }

    fn close_input(&mut self, spec: &InputSessionSpecifier) {
        self.receiver.close(spec);
        if !self.closed {
            self.update_filters();
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
                self.receiver.clean_expired_slots(MonotonicTime::now());
                return Ok(None);
            }
        }
    }

    fn poll(&mut self, deadline: MonotonicTime) -> Result<()> {
        loop {
            self.check_open()?;
            self.pump(deadline)?;
            if MonotonicTime::now() >= deadline {
                self.receiver.clean_expired_slots(MonotonicTime::now());
                return Ok(());
            }
        }
    }

    fn spoof(&mut self, transfer: SpoofTransfer, deadline: MonotonicTime) -> Result<()> {
        self.check_open()?;
        let capacity = self.frame_capacity();
        if transfer.source.is_none() && transfer.payload.len() > capacity {
            return Err(Error::PayloadTooLarge {
                size: transfer.payload.len(),
                max: capacity,
            });
        }
        let id = tx::make_can_id(
            transfer.priority,
            transfer.source,
            &transfer.data_specifier,
            transfer.destination,
            &transfer.payload,
        )?;
        let transfer_id = TransferId::new(transfer.transfer_id.to_u64() % TRANSFER_ID_MODULO);
        let frames =
            tx::break_into_frames(id, transfer_id, &transfer.payload, self.driver.mtu());
        self.submit_frames(&frames, deadline)
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        self.capture = Some(handler);
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(CanTracer::new(
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
