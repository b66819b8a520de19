//! The transfer model: data specifiers, session specifiers, and the transfer
//! types exchanged with transports

use core::fmt;

use crate::time::{MonotonicTime, Timestamp};
use crate::{NodeId, Priority, ServiceId, SubjectId, TransferId};

/// What a transfer carries: a message on a subject, or one leg of a service
/// exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataSpecifier {
    Subject(SubjectId),
    ServiceRequest(ServiceId),
    ServiceResponse(ServiceId),
}

impl DataSpecifier {
    /// Returns true for service requests and responses
    pub fn is_service(&self) -> bool {
        !matches!(self, DataSpecifier::Subject(_))
    }
}

impl fmt::Display for DataSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSpecifier::Subject(subject) => write!(f, "subject {}", subject),
            DataSpecifier::ServiceRequest(service) => write!(f, "request {}", service),
            DataSpecifier::ServiceResponse(service) => write!(f, "response {}", service),
        }
    }
}

/// Identifies an input session: a data specifier plus the remote source
///
/// A source of `None` makes the session promiscuous, accepting transfers from
/// every node (the usual arrangement for message subscriptions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputSessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub source: Option<NodeId>,
}

impl InputSessionSpecifier {
    pub fn promiscuous(data_specifier: DataSpecifier) -> Self {
        InputSessionSpecifier {
            data_specifier,
            source: None,
        }
    }
    pub fn selective(data_specifier: DataSpecifier, source: NodeId) -> Self {
        InputSessionSpecifier {
            data_specifier,
            source: Some(source),
        }
    }

    /// Whether a transfer from `source` on this session's data specifier
    /// belongs to this session
    pub fn accepts(&self, source: Option<NodeId>) -> bool {
        match self.source {
            None => true,
            Some(wanted) => source == Some(wanted),
        }
    }
}

/// Identifies an output session: a data specifier plus the destination
///
/// Message outputs broadcast (`destination: None`); service outputs address a
/// specific node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputSessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub destination: Option<NodeId>,
}

impl OutputSessionSpecifier {
    pub fn broadcast(subject: SubjectId) -> Self {
        OutputSessionSpecifier {
            data_specifier: DataSpecifier::Subject(subject),
            destination: None,
        }
    }
    pub fn request(service: ServiceId, server: NodeId) -> Self {
        OutputSessionSpecifier {
            data_specifier: DataSpecifier::ServiceRequest(service),
            destination: Some(server),
        }
    }
    pub fn response(service: ServiceId, client: NodeId) -> Self {
        OutputSessionSpecifier {
            data_specifier: DataSpecifier::ServiceResponse(service),
            destination: Some(client),
        }
    }
}

/// A transfer submitted to an output session
///
/// Routing (data specifier, destination, source) comes from the session; the
/// transfer itself carries only what varies per call. The deadline is
/// absolute: frames not accepted by the media in time are abandoned.
#[derive(Debug, Clone)]
pub struct TransferOut {
    pub deadline: MonotonicTime,
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub payload: Vec<u8>,
}

/// A transfer surfaced by an input session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIn {
    /// Sampled at the first frame of the transfer
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: TransferId,
    /// `None` for anonymous publishers
    pub source: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// A fully-formed transfer for injection via `spoof`
///
/// Unlike [`TransferOut`] this carries its complete routing, bypassing the
/// session layer: arbitrary source (including anonymous), destination, and
/// transfer ID.
#[derive(Debug, Clone)]
pub struct SpoofTransfer {
    pub deadline: MonotonicTime,
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub source: Option<NodeId>,
    pub destination: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    pub payload: Vec<u8>,
}
