//! The SocketCAN media driver

use std::convert::TryFrom;
use std::time::Duration;

use socketcan::{
    CanFilter, CanFrame as LinuxFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket,
    SocketOptions,
};

use bernicla_can::driver::CanDriver;
use bernicla_can::filter::Filter;
use bernicla_can::{CanFrame, CanId, Mtu};
use bernicla_core::error::{is_transient_io_error, Error, Result};
use bernicla_core::time::{self, MonotonicTime, Timestamp};

/// A classic CAN interface bound through the SocketCAN stack
pub struct SocketCanDriver {
    socket: CanSocket,
    closed: bool,
}

impl SocketCanDriver {
    /// Opens a CAN network interface, e.g. `can0` or `vcan0`
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|error| {
            Error::InvalidTransportConfiguration(format!(
                "cannot open CAN interface {}: {}",
                interface, error
            ))
        })?;
        Ok(SocketCanDriver {
            socket,
            closed: false,
        })
    }
}

impl CanDriver for SocketCanDriver {
    fn mtu(&self) -> Mtu {
        Mtu::Can8
    }

    fn send(&mut self, frames: &[CanFrame], deadline: MonotonicTime) -> Result<()> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        for frame in frames {
            let id = ExtendedId::new(u32::from(frame.id))
                .expect("Bug: CAN ID exceeds 29 bits");
            let linux_frame = LinuxFrame::new(Id::Extended(id), &frame.data)
                .ok_or_else(|| Error::SendFailed("frame payload too long for the bus".into()))?;
            loop {
                let remaining = match time::until(deadline) {
                    Some(remaining) => remaining,
                    None => return Err(Error::Timeout),
                };
                let timeout = remaining.max(Duration::from_millis(1));
                match self
                    .socket
                    .set_write_timeout(timeout)
                    .and_then(|()| self.socket.write_frame(&linux_frame))
                {
                    Ok(()) => break,
                    Err(error) if is_transient_io_error(&error) => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(())
    }

    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(CanFrame, Timestamp)>> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        loop {
            let slice = time::poll_slice(deadline).unwrap_or(Duration::ZERO);
            match self
                .socket
                .read_frame_timeout(slice.max(Duration::from_millis(1)))
            {
                Ok(frame) => {
                    let raw_id = match frame.id() {
                        Id::Extended(id) => id.as_raw(),
                        // Base-format frames do not carry protocol traffic
                        Id::Standard(_) => continue,
                    };
                    let id = CanId::try_from(raw_id).expect("Bug: extended ID exceeds 29 bits");
                    return Ok(Some((CanFrame::new(id, frame.data()), Timestamp::now())));
                }
                Err(error) if is_transient_io_error(&error) => {
                    if MonotonicTime::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn apply_filters(&mut self, filters: &[Filter]) -> Result<()> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        if filters.is_empty() {
            self.socket.set_filter_accept_all()?;
            return Ok(());
        }
        let kernel_filters: Vec<CanFilter> = filters
            .iter()
            .map(|filter| CanFilter::new(filter.id(), filter.mask()))
            .collect();
        self.socket.set_filters(&kernel_filters)?;
        Ok(())
    }

    fn close(&mut self) {
        // The socket is released when the driver drops with the transport
        self.closed = true;
    }
}
