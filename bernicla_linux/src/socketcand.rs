//! A CAN driver speaking the socketcand text protocol over TCP
//!
//! socketcand exposes a CAN interface on the network as a line of
//! angle-bracketed ASCII messages. After the greeting the driver opens the
//! requested bus and switches to raw mode, in which every bus frame arrives
//! as
//!
//! ```text
//! < frame 1064D22A 1585931234.567890 01020304 >
//! ```
//!
//! and frames are transmitted with `< send can_id can_dlc data... >`.

use std::convert::TryFrom;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bernicla_can::driver::CanDriver;
use bernicla_can::filter::Filter;
use bernicla_can::{CanFrame, CanId, Mtu};
use bernicla_core::error::{is_transient_io_error, Error, Result};
use bernicla_core::time::{self, MonotonicTime, Timestamp};

/// The EFF flag some socketcand builds fold into the identifier field
const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote-request flag; such frames carry no protocol traffic
const CAN_RTR_FLAG: u32 = 0x4000_0000;

/// A CAN interface reached through a socketcand server
pub struct SocketcandDriver {
    stream: TcpStream,
    /// Bytes received but not yet terminated by `>`
    pending: Vec<u8>,
    closed: bool,
}

impl SocketcandDriver {
    /// Connects to a socketcand server and opens the named bus in raw mode
    pub fn connect<A: ToSocketAddrs>(address: A, interface: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        let mut driver = SocketcandDriver {
            stream,
            pending: Vec::new(),
            closed: false,
        };
        let handshake_deadline = MonotonicTime::now() + Duration::from_secs(5);
        driver.expect_message("hi", handshake_deadline)?;
        driver.send_message(&format!("< open {} >", interface), handshake_deadline)?;
        driver.expect_message("ok", handshake_deadline)?;
        driver.send_message("< rawmode >", handshake_deadline)?;
        driver.expect_message("ok", handshake_deadline)?;
        Ok(driver)
    }

    fn send_message(&mut self, message: &str, deadline: MonotonicTime) -> Result<()> {
        let bytes = message.as_bytes();
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

    /// Returns the next `< ... >` message body, waiting at most until the
    /// deadline
    fn read_message(&mut self, deadline: MonotonicTime) -> Result<Option<String>> {
        loop {
            if let Some(end) = self.pending.iter().position(|&byte| byte == b'>') {
                let raw: Vec<u8> = self.pending.drain(..=end).collect();
                let text = String::from_utf8_lossy(&raw);
                let body = text
                    .trim_start_matches(|c| c == '<' || c == ' ')
                    .trim_end_matches(|c| c == '>' || c == ' ');
                return Ok(Some(body.trim().to_string()));
            }
            let slice = time::poll_slice(deadline).unwrap_or(Duration::ZERO);
            self.stream
                .set_read_timeout(Some(slice.max(Duration::from_millis(1))))?;
            let mut buffer = [0u8; 4096];
            match self.stream.read(&mut buffer) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "socketcand server closed the connection",
                    )))
                }
                Ok(count) => self.pending.extend_from_slice(&buffer[..count]),
                Err(error) if is_transient_io_error(&error) => {
                    if MonotonicTime::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn expect_message(&mut self, expected: &str, deadline: MonotonicTime) -> Result<()> {
        match self.read_message(deadline)? {
            Some(body) if body == expected => Ok(()),
            Some(body) => Err(Error::InvalidTransportConfiguration(format!(
                "socketcand answered {:?} where {:?} was expected",
                body, expected
            ))),
            None => Err(Error::Timeout),
        }
    }
}

/// Parses the body of a raw-mode `frame` message into a timestamped frame
fn parse_frame_message(body: &str) -> Option<(SystemTime, CanFrame)> {
    let mut parts = body.split_ascii_whitespace();
    if parts.next()? != "frame" {
        return None;
    }
    let raw_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    if raw_id & CAN_RTR_FLAG != 0 {
        return None;
    }
    let id = CanId::try_from(raw_id & !CAN_EFF_FLAG & CanId::MAX).ok()?;

    let stamp = parts.next()?;
    let (seconds, micros) = stamp.split_once('.').unwrap_or((stamp, "0"));
    let seconds: u64 = seconds.parse().ok()?;
    let micros: u64 = micros.parse().ok()?;
    let system = UNIX_EPOCH + Duration::from_secs(seconds) + Duration::from_micros(micros);

    let hex = parts.next().unwrap_or("");
    if hex.len() % 2 != 0 {
        return None;
    }
    let data: Option<Vec<u8>> = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = core::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect();
    Some((system, CanFrame { id, data: data? }))
}

/// Encodes one frame as a raw-mode `send` command
fn frame_message(frame: &CanFrame) -> String {
    let mut message = format!("< send {:X} {}", u32::from(frame.id), frame.data.len());
    for byte in &frame.data {
        message.push_str(&format!(" {:02X}", byte));
    }
    message.push_str(" >");
    message
}

impl CanDriver for SocketcandDriver {
    fn mtu(&self) -> Mtu {
        Mtu::Can8
    }

    fn send(&mut self, frames: &[CanFrame], deadline: MonotonicTime) -> Result<()> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        for frame in frames {
            self.send_message(&frame_message(frame), deadline)?;
        }
        Ok(())
    }

    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(CanFrame, Timestamp)>> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        loop {
            let body = match self.read_message(deadline)? {
                Some(body) => body,
                None => return Ok(None),
            };
            if let Some((system, frame)) = parse_frame_message(&body) {
                let timestamp = Timestamp {
                    system,
                    monotonic: MonotonicTime::now(),
                };
                return Ok(Some((frame, timestamp)));
            }
            // Acknowledgements and echoes are not bus traffic
            if body.starts_with("error") {
                log::warn!("socketcand reported: {}", body);
            }
            if MonotonicTime::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn apply_filters(&mut self, _filters: &[Filter]) -> Result<()> {
        // Raw mode delivers everything; filtering happens in the transport
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_raw_mode_frames() {
        let (system, frame) =
            parse_frame_message("frame 1064D22A 1585931234.567890 01020304").unwrap();
        assert_eq!(u32::from(frame.id), 0x1064d22a);
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
        let since_epoch = system.duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(since_epoch.as_secs(), 1585931234);
        assert_eq!(since_epoch.subsec_micros(), 567890);
    }

    #[test]
    fn eff_flag_stripped_rtr_dropped() {
        let (_, frame) =
            parse_frame_message("frame 9064D22A 1.000000 0102").unwrap();
        assert_eq!(u32::from(frame.id), 0x1064d22a);
        assert!(parse_frame_message("frame 40000123 1.000000").is_none());
    }

    #[test]
    fn non_frame_messages_ignored() {
        assert!(parse_frame_message("ok").is_none());
        assert!(parse_frame_message("error could not open bus").is_none());
    }

    #[test]
    fn send_command_layout() {
        let frame = CanFrame {
            id: CanId::try_from(0x1064d22au32).unwrap(),
            data: vec![0x01, 0xff],
        };
        assert_eq!(frame_message(&frame), "< send 1064D22A 2 01 FF >");
    }
}
