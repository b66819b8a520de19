//! Replays candump text logs as a receive-only CAN medium
//!
//! Understands the compact `candump -L` format, one frame per line:
//!
//! ```text
//! (1585931234.567890) can0 1064D22A#0102030405060708
//! ```
//!
//! Timestamps from the log are preserved in the wall-clock half of each
//! frame's [`Timestamp`], which lets tracers reconstruct historical traffic.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bernicla_can::driver::CanDriver;
use bernicla_can::filter::Filter;
use bernicla_can::{CanFrame, CanId, Mtu};
use bernicla_core::error::{Error, Result};
use bernicla_core::time::{MonotonicTime, Timestamp};

/// A receive-only driver that delivers frames recorded in a candump log
pub struct CandumpReplayDriver {
    frames: VecDeque<(SystemTime, CanFrame)>,
    closed: bool,
}

impl CandumpReplayDriver {
    /// Loads a log file; unparseable lines are skipped with a warning
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut frames = VecDeque::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed) {
                Some(entry) => frames.push_back(entry),
                None => log::warn!("candump line {} not understood, skipping", number + 1),
            }
        }
        Ok(CandumpReplayDriver {
            frames,
            closed: false,
        })
    }

    /// Frames not yet replayed
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

/// Parses one `candump -L` line into a timestamped frame
fn parse_line(line: &str) -> Option<(SystemTime, CanFrame)> {
    let mut parts = line.split_ascii_whitespace();
    let stamp = parts.next()?;
    let _interface = parts.next()?;
    let frame = parts.next()?;

    let stamp = stamp.strip_prefix('(')?.strip_suffix(')')?;
    let (seconds, micros) = stamp.split_once('.')?;
    let seconds: u64 = seconds.parse().ok()?;
    let micros: u64 = micros.parse().ok()?;
    let time = UNIX_EPOCH + Duration::from_secs(seconds) + Duration::from_micros(micros);

    let (id, data) = frame.split_once('#')?;
    // Remote frames (`R`) and CAN FD flag fields are not protocol traffic
    if data.starts_with('R') {
        return None;
    }
    let id = CanId::try_from(u32::from_str_radix(id, 16).ok()?).ok()?;
    let data = decode_hex(data)?;
    Some((time, CanFrame { id, data }))
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = core::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

impl CanDriver for CandumpReplayDriver {
    fn mtu(&self) -> Mtu {
        Mtu::Can8
    }

    fn send(&mut self, _frames: &[CanFrame], _deadline: MonotonicTime) -> Result<()> {
        Err(Error::UnsupportedCapability(
            "candump replay is receive-only",
        ))
    }

    fn receive(&mut self, _deadline: MonotonicTime) -> Result<Option<(CanFrame, Timestamp)>> {
        if self.closed {
            return Err(Error::ResourceClosed);
        }
        Ok(self.frames.pop_front().map(|(system, frame)| {
            (
                frame,
                Timestamp {
                    system,
                    monotonic: MonotonicTime::now(),
                },
            )
        }))
    }

    fn apply_filters(&mut self, _filters: &[Filter]) -> Result<()> {
        // Replay delivers everything; filtering happens in the transport
        Ok(())
    }

    fn close(&mut self) {
        self.frames.clear();
        self.closed = true;
    }
}
