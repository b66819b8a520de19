//! Multicast group and port assignment
//!
//! Every subject maps to a fixed multicast group derived from the subject ID;
//! every service exchange maps to a group derived from the destination node
//! ID. Message subjects share one well-known port, services another.

use std::net::{Ipv4Addr, SocketAddrV4};

use bernicla_core::error::{Error, Result};
use bernicla_core::transfer::{DataSpecifier, OutputSessionSpecifier};
use bernicla_core::{NodeId, SubjectId};

/// The well-known destination port for message subjects
pub const MESSAGE_PORT: u16 = 9382;

/// The well-known destination port for service transfers
pub const SERVICE_PORT: u16 = 9383;

/// The multicast group carrying one subject
pub fn subject_group(subject: SubjectId) -> SocketAddrV4 {
    let value = u16::from(subject);
    SocketAddrV4::new(
        Ipv4Addr::new(239, 0, (value >> 8) as u8, value as u8),
        MESSAGE_PORT,
    )
}

/// The multicast group carrying service transfers addressed to one node
pub fn service_group(destination: NodeId) -> SocketAddrV4 {
    let value = u16::from(destination);
    SocketAddrV4::new(
        Ipv4Addr::new(239, 1, (value >> 8) as u8, value as u8),
        SERVICE_PORT,
    )
}

/// Where frames of an output session are sent
pub fn output_endpoint(spec: &OutputSessionSpecifier) -> Result<SocketAddrV4> {
    match (&spec.data_specifier, spec.destination) {
        (DataSpecifier::Subject(subject), None) => Ok(subject_group(*subject)),
        (DataSpecifier::Subject(_), Some(_)) => Err(Error::InvalidTransportConfiguration(
            "message outputs broadcast and take no destination".into(),
        )),
        (_, Some(destination)) => Ok(service_group(destination)),
        (_, None) => Err(Error::InvalidTransportConfiguration(
            "service outputs require a destination node".into(),
        )),
    }
}
