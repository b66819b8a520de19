//! Sideband capture records and transfer-level trace reconstruction
//!
//! A transport with an active capture handler emits one [`Capture`] per frame
//! it observes, in both directions. A [`Tracer`] folds a chronologically
//! ordered capture stream back into transfers, which makes offline analysis
//! of logged traffic possible without a live bus.

use crate::error::ReassemblyError;
use crate::time::Timestamp;
use crate::transfer::{DataSpecifier, TransferIn};
use crate::NodeId;

/// Which way a captured frame was travelling relative to the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// One observed frame, opaque to the capture machinery
///
/// The variants carry the raw on-wire unit of each transport: an arbitration
/// ID plus data for CAN, a whole datagram for UDP, and a delimited
/// (COBS-decoded) frame for serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedFrame {
    Can { id: u32, data: Vec<u8> },
    Udp { datagram: Vec<u8> },
    Serial { frame: Vec<u8> },
}

/// A capture record delivered to capture handlers
///
/// Handlers run on the transport's I/O path and must not block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub frame: CapturedFrame,
}

/// The callback registered through `Transport::begin_capture`
pub type CaptureHandler = Box<dyn FnMut(&Capture)>;

/// A transfer reconstructed by a tracer, with its full routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedTransfer {
    pub data_specifier: DataSpecifier,
    pub destination: Option<NodeId>,
    pub transfer: TransferIn,
}

/// Output of a tracer: a completed transfer or a protocol-level defect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Transfer(TracedTransfer),
    Error {
        timestamp: Timestamp,
        error: ReassemblyError,
    },
}

/// Reconstructs transfers from a chronologically ordered capture stream
///
/// Tracers are stateful; captures must be fed in observation order. A capture
/// that completes a transfer or reveals a defect yields an event, all others
/// return `None`.
pub trait Tracer {
    fn update(&mut self, capture: &Capture) -> Option<TraceEvent>;
}
