//! Byte movers for the serial transport
//!
//! Two production drivers: a raw POSIX serial device configured through
//! termios, and a TCP tunnel for serial ports exposed over the network
//! (terminal servers, `socat`, simulators). Both move opaque bytes; COBS
//! framing happens in the transport.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bernicla_core::error::{is_transient_io_error, Error, Result};
use bernicla_core::time::{self, MonotonicTime};

/// A serial byte-stream driver
pub trait SerialDriver {
    /// Writes the whole buffer, blocking at most until the deadline
    fn send(&mut self, bytes: &[u8], deadline: MonotonicTime) -> Result<()>;

    /// Reads whatever is available into `buffer`, waiting at most until the
    /// deadline; returns the number of bytes read (0 on deadline expiry)
    fn receive(&mut self, buffer: &mut [u8], deadline: MonotonicTime) -> Result<usize>;

    /// Releases OS resources; idempotent
    fn close(&mut self);
}

/// Serial over a TCP connection
pub struct TcpTunnelDriver {
    stream: TcpStream,
    closed: bool,
}

impl TcpTunnelDriver {
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Ok(TcpTunnelDriver {
            stream,
            closed: false,
        })
    }
}

impl SerialDriver for TcpTunnelDriver {
    fn send(&mut self, bytes: &[u8], deadline: MonotonicTime) -> Result<()> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        let mut written = 0;
        while written < bytes.len() {
            let remaining = match time::until(deadline) {
                Some(remaining) => remaining,
                None => return Err(Error::Timeout),
            };
            self.stream
                .set_write_timeout(Some(remaining.max(Duration::from_millis(1))))?;
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(Error::SendFailed("connection closed by peer".into())),
                Ok(count) => written += count,
                Err(error) if is_transient_io_error(&error) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8], deadline: MonotonicTime) -> Result<usize> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        let slice = time::poll_slice(deadline).unwrap_or(Duration::ZERO);
        self.stream
            .set_read_timeout(Some(slice.max(Duration::from_millis(1))))?;
        match self.stream.read(buffer) {
            Ok(count) => Ok(count),
            Err(error) if is_transient_io_error(&error) => Ok(0),
            Err(error) => Err(error.into()),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.closed = true;
        }
    }
}

/// A raw POSIX serial device
#[cfg(unix)]
pub struct PosixSerialDriver {
    file: std::fs::File,
    closed: bool,
}

#[cfg(unix)]
impl PosixSerialDriver {
    /// Opens a serial device and configures it raw at the given baud rate
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        use nix::sys::termios::{self, SetArg};
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc_nonblock())
            .open(path)?;

        let baud = baud_rate(baud).ok_or_else(|| {
            Error::InvalidTransportConfiguration(format!("unsupported baud rate {}", baud))
        })?;
        let mut attributes = termios::tcgetattr(&file)
            .map_err(|errno| Error::Io(std::io::Error::from(errno)))?;
        termios::cfmakeraw(&mut attributes);
        termios::cfsetspeed(&mut attributes, baud)
            .map_err(|errno| Error::Io(std::io::Error::from(errno)))?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &attributes)
            .map_err(|errno| Error::Io(std::io::Error::from(errno)))?;

        Ok(PosixSerialDriver {
            file,
            closed: false,
        })
    }
}

#[cfg(unix)]
fn libc_nonblock() -> i32 {
    nix::fcntl::OFlag::O_NONBLOCK.bits()
}

#[cfg(unix)]
fn baud_rate(baud: u32) -> Option<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate;
    match baud {
        9_600 => Some(BaudRate::B9600),
        19_200 => Some(BaudRate::B19200),
        38_400 => Some(BaudRate::B38400),
        57_600 => Some(BaudRate::B57600),
        115_200 => Some(BaudRate::B115200),
        230_400 => Some(BaudRate::B230400),
        _ => None,
    }
}

#[cfg(unix)]
impl SerialDriver for PosixSerialDriver {
    fn send(&mut self, bytes: &[u8], deadline: MonotonicTime) -> Result<()> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        let mut written = 0;
        while written < bytes.len() {
            match self.file.write(&bytes[written..]) {
                Ok(count) => written += count,
                Err(error) if is_transient_io_error(&error) => {
                    if MonotonicTime::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8], deadline: MonotonicTime) -> Result<usize> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        loop {
            match self.file.read(buffer) {
                Ok(count) => return Ok(count),
                Err(error) if is_transient_io_error(&error) => {
                    if MonotonicTime::now() >= deadline {
                        return Ok(0);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn close(&mut self) {
        // The descriptor is released when the file drops with the transport
        self.closed = true;
    }
}
