//! The media-driver interface consumed by the CAN transport
//!
//! Implementations live close to the OS: SocketCAN and the candump replayer
//! are provided by `bernicla_linux`. Drivers move whole frames and never look
//! inside the protocol.

use bernicla_core::error::Result;
use bernicla_core::time::{MonotonicTime, Timestamp};

use crate::data::{CanFrame, Mtu};
use crate::filter::Filter;

/// A CAN media driver
///
/// All waiting calls take absolute monotonic deadlines. Transient I/O
/// conditions are the driver's problem: they are retried internally and never
/// surface. Fatal conditions (interface gone) surface as `Error::Io` and
/// leave the driver closed.
pub trait CanDriver {
    /// The largest frame payload this medium carries (8 or 64 bytes)
    fn mtu(&self) -> Mtu;

    /// Enqueues frames for transmission, in order, atomically
    ///
    /// Returns `Error::Timeout` if the deadline passes before the medium
    /// accepts every frame; frames not yet accepted are abandoned.
    fn send(&mut self, frames: &[CanFrame], deadline: MonotonicTime) -> Result<()>;

    /// Waits for one inbound frame until the deadline
    ///
    /// `Ok(None)` means the deadline passed with nothing to deliver.
    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(CanFrame, Timestamp)>>;

    /// Optional hint: restrict inbound traffic to the given acceptance filters
    ///
    /// Drivers without kernel or hardware filtering simply ignore this.
    fn apply_filters(&mut self, filters: &[Filter]) -> Result<()>;

    /// Releases OS resources; idempotent
    fn close(&mut self);
}
