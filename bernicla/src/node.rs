//!
//! Configuration-driven port construction
//!
//! A node's ports are declared by registers of the form
//! `uavcan.{pub,sub,srv,cln}.<name>.id`. The layout is resolved from a
//! register map up front; typed ports are then instantiated by name, so the
//! application never hard-codes port IDs.
//!

use std::collections::HashMap;
use std::convert::TryFrom;

use bernicla_core::error::{Error, Result};
use bernicla_core::{NodeId, Priority, ServiceId, SubjectId};

use crate::encoding::{Deserialize, Message, Request, Response, Serialize};
use crate::presentation::{Client, Presentation, Publisher, Server, Subscriber};
use crate::register::RegisterMap;

/// The four port roles a register can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Publisher,
    Subscriber,
    Server,
    Client,
}

impl PortKind {
    fn register_segment(self) -> &'static str {
        match self {
            PortKind::Publisher => "pub",
            PortKind::Subscriber => "sub",
            PortKind::Server => "srv",
            PortKind::Client => "cln",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "pub" => Some(PortKind::Publisher),
            "sub" => Some(PortKind::Subscriber),
            "srv" => Some(PortKind::Server),
            "cln" => Some(PortKind::Client),
            _ => None,
        }
    }
}

/// Port-ID assignments resolved from configuration: name to (kind, port ID)
#[derive(Debug, Clone, Default)]
pub struct PortLayout {
    entries: HashMap<(PortKindKey, String), u16>,
}

type PortKindKey = u8;

fn kind_key(kind: PortKind) -> PortKindKey {
    kind as PortKindKey
}

impl PortLayout {
    /// Collects every `uavcan.{pub,sub,srv,cln}.<name>.id` register
    pub fn from_registers(registers: &RegisterMap) -> Result<Self> {
        let mut layout = PortLayout::default();
        for (name, value) in registers.iter() {
            let mut segments = name.split('.');
            if segments.next() != Some("uavcan") {
                continue;
            }
            let kind = match segments.next().and_then(PortKind::from_segment) {
                Some(kind) => kind,
                None => continue,
            };
            let port_name: Vec<&str> = segments.collect();
            let (last, port_segments) = match port_name.split_last() {
                Some(split) => split,
                None => continue,
            };
            if *last != "id" || port_segments.is_empty() {
                continue;
            }
            let port_id: u16 = value.parse().map_err(|_| {
                Error::InvalidTransportConfiguration(format!(
                    "register {} is not a port ID: {:?}",
                    name, value
                ))
            })?;
            layout
                .entries
                .insert((kind_key(kind), port_segments.join(".")), port_id);
        }
        Ok(layout)
    }

    pub fn insert(&mut self, kind: PortKind, name: &str, port_id: u16) {
        self.entries.insert((kind_key(kind), name.to_string()), port_id);
    }

    pub fn get(&self, kind: PortKind, name: &str) -> Option<u16> {
        self.entries.get(&(kind_key(kind), name.to_string())).copied()
    }

    fn require(&self, kind: PortKind, name: &str) -> Result<u16> {
        self.get(kind, name).ok_or_else(|| {
            Error::InvalidTransportConfiguration(format!(
                "no port ID configured: register uavcan.{}.{}.id is missing",
                kind.register_segment(),
                name
            ))
        })
    }
}

/// A presentation instance paired with its configured port layout
pub struct Node {
    presentation: Presentation,
    layout: PortLayout,
}

impl Node {
    pub fn new(presentation: Presentation, layout: PortLayout) -> Self {
        Node {
            presentation,
            layout,
        }
    }

    /// Reads the port layout from a register map
    pub fn from_registers(presentation: Presentation, registers: &RegisterMap) -> Result<Self> {
        Ok(Node {
            presentation,
            layout: PortLayout::from_registers(registers)?,
        })
    }

    pub fn presentation(&self) -> &Presentation {
        &self.presentation
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    /// Instantiates the publisher declared under `uavcan.pub.<name>.id`
    pub fn publisher<T: Message + Serialize>(
        &self,
        name: &str,
        priority: Priority,
    ) -> Result<Publisher<T>> {
        let id = self.layout.require(PortKind::Publisher, name)?;
        let subject = SubjectId::try_from(id)?;
        self.presentation.make_publisher(subject, priority)
    }

    /// Instantiates the subscriber declared under `uavcan.sub.<name>.id`
    pub fn subscriber<T: Message + Deserialize>(&self, name: &str) -> Result<Subscriber<T>> {
        let id = self.layout.require(PortKind::Subscriber, name)?;
        let subject = SubjectId::try_from(id)?;
        self.presentation.make_subscriber(subject)
    }

    /// Instantiates the server declared under `uavcan.srv.<name>.id`
    pub fn server<Req, Resp>(&self, name: &str) -> Result<Server<Req, Resp>>
    where
        Req: Request + Deserialize,
        Resp: Response + Serialize,
    {
        let id = self.layout.require(PortKind::Server, name)?;
        let service = ServiceId::try_from(id)?;
        self.presentation.make_server(service)
    }

    /// Instantiates the client declared under `uavcan.cln.<name>.id`
    pub fn client<Req, Resp>(&self, name: &str, server: NodeId) -> Result<Client<Req, Resp>>
    where
        Req: Request + Serialize,
        Resp: Response + Deserialize,
    {
        let id = self.layout.require(PortKind::Client, name)?;
        let service = ServiceId::try_from(id)?;
        self.presentation.make_client(service, server)
    }
}
