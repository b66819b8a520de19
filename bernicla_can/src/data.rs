//! CAN frame and identifier types

use core::convert::TryFrom;
use core::fmt;

use bernicla_core::error::Error;

/// The number of data bytes a CAN frame can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtu {
    /// CAN 2.0: up to 8 bytes per frame
    Can8 = 8,
    /// CAN FD: up to 64 bytes per frame
    CanFd64 = 64,
}

impl Mtu {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    /// Rounds a frame length up to the nearest length the bus can express
    ///
    /// CAN FD frames longer than 8 bytes exist only in the discrete steps
    /// 12, 16, 20, 24, 32, 48, and 64; CAN 2.0 can express every length.
    pub fn round_frame_length(self, length: usize) -> usize {
        match self {
            Mtu::Can8 => length,
            Mtu::CanFd64 => match length {
                0..=8 => length,
                9..=12 => 12,
                13..=16 => 16,
                17..=20 => 20,
                21..=24 => 24,
                25..=32 => 32,
                33..=48 => 48,
                _ => 64,
            },
        }
    }
}

/// A 29-bit extended CAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanId(u32);

impl CanId {
    /// The largest valid 29-bit identifier
    pub const MAX: u32 = 0x1fff_ffff;
}

impl TryFrom<u32> for CanId {
    type Error = Error;
    fn try_from(bits: u32) -> Result<Self, Error> {
        if bits <= Self::MAX {
            Ok(CanId(bits))
        } else {
            Err(Error::InvalidValue("CAN ID"))
        }
    }
}
impl From<CanId> for u32 {
    fn from(id: CanId) -> Self {
        id.0
    }
}
impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// One CAN data frame
///
/// Only extended-ID data frames participate in the protocol; remote and
/// error frames never reach this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: CanId,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Self {
        CanFrame {
            id,
            data: data.to_vec(),
        }
    }
}
