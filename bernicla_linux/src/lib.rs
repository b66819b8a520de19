//!
//! Linux media drivers for the CAN transport: SocketCAN, socketcand over
//! TCP, and a candump log replayer for offline analysis
//!

mod candump;
mod socketcan_driver;
mod socketcand;

pub use crate::candump::CandumpReplayDriver;
pub use crate::socketcan_driver::SocketCanDriver;
pub use crate::socketcand::SocketcandDriver;
