//! Datagram movers for the UDP transport
//!
//! The trait exists so that tests can run the transport over an in-memory
//! pipe; production code uses [`UdpSocketDriver`].

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use bernicla_core::error::{is_transient_io_error, Error, Result};
use bernicla_core::time::{self, MonotonicTime, Timestamp};

use crate::address::{MESSAGE_PORT, SERVICE_PORT};

/// Moves raw datagrams for the UDP transport
pub trait UdpDriver {
    /// Sends one datagram to a multicast group, blocking at most until the
    /// deadline
    fn send(&mut self, destination: SocketAddrV4, datagram: &[u8], deadline: MonotonicTime)
        -> Result<()>;

    /// Waits for one inbound datagram until the deadline
    ///
    /// A deadline in the past degenerates to a non-blocking poll.
    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(Vec<u8>, Timestamp)>>;

    /// Subscribes the receive path to a multicast group
    fn join(&mut self, group: SocketAddrV4) -> Result<()>;

    /// Unsubscribes from a multicast group
    fn leave(&mut self, group: SocketAddrV4);

    /// Releases OS resources; idempotent
    fn close(&mut self);
}

/// The standard two-socket driver: one bound to the message port, one to the
/// service port, plus an unbound socket for transmission
pub struct UdpSocketDriver {
    local_address: Ipv4Addr,
    message_socket: UdpSocket,
    service_socket: UdpSocket,
    tx_socket: UdpSocket,
    closed: bool,
}

impl UdpSocketDriver {
    /// Binds the driver to a local interface address
    pub fn new(local_address: Ipv4Addr) -> Result<Self> {
        let message_socket = bind_rx_socket(MESSAGE_PORT)?;
        let service_socket = bind_rx_socket(SERVICE_PORT)?;

        let tx = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        tx.set_multicast_if_v4(&local_address)?;
        tx.set_multicast_loop_v4(true)?;
        tx.bind(&SocketAddrV4::new(local_address, 0).into())?;
        let tx_socket: UdpSocket = tx.into();

        Ok(UdpSocketDriver {
            local_address,
            message_socket,
            service_socket,
            tx_socket,
            closed: false,
        })
    }

    fn socket_for_port(&self, port: u16) -> &UdpSocket {
        if port == SERVICE_PORT {
            &self.service_socket
        } else {
            &self.message_socket
        }
    }

    /// One bounded wait on one socket
    fn try_receive(
        socket: &UdpSocket,
        timeout: Duration,
    ) -> Result<Option<(Vec<u8>, Timestamp)>> {
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buffer = [0u8; 65536];
        match socket.recv_from(&mut buffer) {
            Ok((length, _)) => {
                let timestamp = Timestamp::now();
                Ok(Some((buffer[..length].to_vec(), timestamp)))
            }
            Err(error) if is_transient_io_error(&error) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

fn bind_rx_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket.into())
}

impl UdpDriver for UdpSocketDriver {
    fn send(
        &mut self,
        destination: SocketAddrV4,
        datagram: &[u8],
        deadline: MonotonicTime,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        loop {
            match self.tx_socket.send_to(datagram, destination) {
                Ok(_) => return Ok(()),
                Err(error) if is_transient_io_error(&error) => {
                    if MonotonicTime::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(Vec<u8>, Timestamp)>> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        // Alternate between the two sockets in short slices so neither port
        // can starve the other.
        loop {
            let slice = time::poll_slice(deadline).unwrap_or(Duration::ZERO);
            let half = (slice / 2).max(Duration::from_millis(1));
            if let Some(received) = Self::try_receive(&self.message_socket, half)? {
                return Ok(Some(received));
            }
            if let Some(received) = Self::try_receive(&self.service_socket, half)? {
                return Ok(Some(received));
            }
            if MonotonicTime::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn join(&mut self, group: SocketAddrV4) -> Result<()> {
        self.socket_for_port(group.port())
            .join_multicast_v4(group.ip(), &self.local_address)?;
        Ok(())
    }

    fn leave(&mut self, group: SocketAddrV4) {
        let _ = self
            .socket_for_port(group.port())
            .leave_multicast_v4(group.ip(), &self.local_address);
    }

    fn close(&mut self) {
        // Dropping the sockets on transport teardown releases them; the flag
        // just fences further use.
        self.closed = true;
    }
}
