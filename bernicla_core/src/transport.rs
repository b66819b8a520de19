//! The transport abstraction consumed by the presentation layer
//!
//! Concrete transports (CAN, UDP, serial) and the redundant pseudo-transport
//! all implement [`Transport`]. The trait is object-safe: the presentation
//! layer holds a `Box<dyn Transport>` and never names a concrete type.

use crate::error::Result;
use crate::time::MonotonicTime;
use crate::trace::{CaptureHandler, Tracer};
use crate::transfer::{
    InputSessionSpecifier, OutputSessionSpecifier, SpoofTransfer, TransferIn, TransferOut,
};
use crate::NodeId;

/// Static properties of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParameters {
    /// The modulo of the transfer-ID sequence; 0 denotes the full 64-bit range
    pub transfer_id_modulo: u64,
    /// The largest valid node ID
    pub max_node_id: u16,
    /// The largest payload carried by a single frame
    pub mtu: usize,
}

/// Traffic counters, written only from the transport's own context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatistics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub transfers_sent: u64,
    pub transfers_received: u64,
    /// Reassembly defects: CRC mismatches, toggle errors, regressions, timeouts
    pub reassembly_errors: u64,
    /// Frames observed but not usable: malformed, foreign destination, no session
    pub frames_dropped: u64,
}

/// One Cyphal transport: session management, fragmentation, reassembly
///
/// Sessions are owned by the transport and created through `open_input` /
/// `open_output`; they are identified by their specifiers rather than by
/// handles so that the trait stays object-safe and the redundant
/// pseudo-transport can mirror sessions onto its inferiors.
pub trait Transport {
    fn protocol_parameters(&self) -> ProtocolParameters;

    /// The local node ID, or `None` when operating anonymously
    fn local_node_id(&self) -> Option<NodeId>;

    /// Creates (or references) the output session for the given specifier
    fn open_output(&mut self, spec: &OutputSessionSpecifier) -> Result<()>;

    /// Destroys the output session once no port references it
    fn close_output(&mut self, spec: &OutputSessionSpecifier);

    /// Fragments a transfer into frames and submits them to the media
    ///
    /// Frames of one transfer are pushed atomically and in order with respect
    /// to this session. The call blocks at most until `transfer.deadline`.
    fn send(&mut self, spec: &OutputSessionSpecifier, transfer: TransferOut) -> Result<()>;

    /// Creates (or references) the input session for the given specifier
    ///
    /// `extent` is the maximum payload size this session must buffer, as
    /// declared by the DSDL type; longer reassemblies are discarded.
    fn open_input(&mut self, spec: &InputSessionSpecifier, extent: usize) -> Result<()>;

    /// Destroys the input session once no port references it
    fn close_input(&mut self, spec: &InputSessionSpecifier);

    /// Returns the next transfer of the given input session, waiting at most
    /// until `deadline`
    ///
    /// While waiting, inbound frames of *all* sessions are processed;
    /// transfers for other sessions stay queued on those sessions. `Ok(None)`
    /// means the deadline passed.
    fn receive(
        &mut self,
        spec: &InputSessionSpecifier,
        deadline: MonotonicTime,
    ) -> Result<Option<TransferIn>>;

    /// Processes inbound frames without a target session, waiting at most
    /// until `deadline`
    ///
    /// Useful to keep captures and background sessions serviced while no port
    /// is actively receiving.
    fn poll(&mut self, deadline: MonotonicTime) -> Result<()>;

    /// Injects a fabricated transfer with arbitrary routing
    ///
    /// Spoofing does not touch session state or transfer-ID counters. Where
    /// the platform cannot express the requested origin the implementation
    /// fails with `UnsupportedCapability`.
    fn spoof(&mut self, transfer: SpoofTransfer, deadline: MonotonicTime) -> Result<()>;

    /// Starts delivering one capture record per observed frame
    ///
    /// Handlers are invoked from the transport's I/O context and must not
    /// block. Capturing cannot be stopped short of closing the transport.
    fn begin_capture(&mut self, handler: CaptureHandler);

    /// Creates a tracer able to reconstruct this transport's capture stream
    fn make_tracer(&self) -> Box<dyn Tracer>;

    fn statistics(&self) -> TransportStatistics;

    /// Closes the transport and every session it owns; idempotent
    ///
    /// Subsequent operations fail with `ResourceClosed`; blocked operations
    /// observe the closure within one poll quantum.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
