//! The error taxonomy shared by all layers

use thiserror::Error;

/// Errors surfaced to users of the stack
#[derive(Debug, Error)]
pub enum Error {
    /// The deadline elapsed before the operation could complete
    ///
    /// This is benign: `receive` returning nothing and `publish` returning
    /// `false` are expressed through it.
    #[error("deadline elapsed")]
    Timeout,

    /// Bad endpoint, invalid node ID, conflicting port ID, and similar
    /// construction-time problems
    #[error("invalid transport configuration: {0}")]
    InvalidTransportConfiguration(String),

    /// The platform or transport cannot perform the requested operation
    #[error("capability not supported: {0}")]
    UnsupportedCapability(&'static str),

    /// The transport or session was closed before or during the operation
    #[error("resource closed")]
    ResourceClosed,

    /// The media refused the frames, or every redundant inferior errored
    #[error("transmission failed: {0}")]
    SendFailed(String),

    /// The payload cannot fit into the transport's maximum transfer size
    #[error("payload of {size} bytes exceeds the limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// A value is outside the permitted range for the named identifier
    #[error("value out of range for {0}")]
    InvalidValue(&'static str),

    /// A fatal media error
    ///
    /// Transient conditions are retried inside the media drivers and never
    /// reach this variant.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Problems encountered while reassembling transfers from frames
///
/// These are never returned to callers. They are counted in the transport
/// statistics and emitted by tracers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("transfer CRC mismatch")]
    CrcMismatch,
    #[error("frame toggle bit out of sequence")]
    ToggleMismatch,
    #[error("frame is not the start of a transfer and no reassembly is in progress")]
    MissedStart,
    #[error("frame index out of the reorder window")]
    FrameIndexOutOfRange,
    #[error("transfer ID regressed outside the tolerance window")]
    TransferIdRegression,
    #[error("reassembled payload exceeds the declared extent")]
    ExtentExceeded,
    #[error("partial transfer abandoned after the gap timeout")]
    GapTimeout,
    #[error("malformed frame header")]
    MalformedFrame,
    #[error("unsupported frame header version")]
    VersionMismatch,
    #[error("anonymous transfer spans multiple frames")]
    AnonymousMultiFrame,
}

/// Returns whether an I/O error kind is transient and worth retrying
///
/// Fatal errors (interface gone: `ENODEV`, `ENXIO`, `EBADF`) close the media
/// instance instead.
pub fn is_transient_io_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    ) || matches!(error.raw_os_error(), Some(code) if code == 105) // ENOBUFS
}
