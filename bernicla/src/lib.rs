//!
//! Host-side Cyphal: presentation layer and re-exports from the rest of the
//! stack
//!
//! The layering is strict: this crate talks to transports exclusively through
//! [`bernicla_core::transport::Transport`], the redundant pseudo-transport
//! satisfies that interface over any mix of concrete transports, and each
//! concrete transport drives a media driver.
//!

pub mod encoding;
pub mod node;
pub mod presentation;
pub mod register;

pub use crate::encoding::{Deserialize, DeserializeError, Message, Request, Response, Serialize};
pub use crate::node::{Node, PortKind, PortLayout};
pub use crate::presentation::{
    Client, Presentation, Publisher, ResponseToken, Server, Subscriber, TransferMetadata,
};
pub use crate::register::RegisterMap;

// Reexports from the other bernicla crates
pub use bernicla_core::error::{self, Error};
pub use bernicla_core::session;
pub use bernicla_core::time;
pub use bernicla_core::trace;
pub use bernicla_core::transfer;
pub use bernicla_core::transport;
pub use bernicla_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

pub mod can {
    //! The Cyphal/CAN transport
    pub use bernicla_can::*;
}
pub mod udp {
    //! The Cyphal/UDP transport
    pub use bernicla_udp::*;
}
pub mod serial {
    //! The Cyphal/serial transport
    pub use bernicla_serial::*;
}
pub mod redundant {
    //! The redundant pseudo-transport
    pub use bernicla_redundant::*;
}
