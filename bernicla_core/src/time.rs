//! Time handling
//!
//! Deadlines across the stack are absolute values of the host monotonic
//! clock. Wall-clock time appears only inside [`Timestamp`]s attached to
//! received transfers and capture records.

use std::time::{Duration, Instant, SystemTime};

/// An absolute point on the host monotonic clock
pub type MonotonicTime = Instant;

/// The moment an event was observed, on both host clocks
///
/// For a received transfer this is sampled at the arrival of its first frame;
/// for an emitted transfer, at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub system: SystemTime,
    pub monotonic: MonotonicTime,
}

impl Timestamp {
    /// Samples both clocks now
    pub fn now() -> Self {
        Timestamp {
            system: SystemTime::now(),
            monotonic: Instant::now(),
        }
    }
}

/// Returns the time remaining until `deadline`, or `None` if it has passed
pub fn until(deadline: MonotonicTime) -> Option<Duration> {
    deadline.checked_duration_since(Instant::now())
}

/// The longest interval a single media wait may hold the loop
///
/// Waits bounded by a distant deadline are chopped into slices of at most
/// this length so that session expiry and capture delivery stay responsive.
pub const POLL_QUANTUM: Duration = Duration::from_millis(5);

/// Clamps the wait for `deadline` to one poll quantum
pub fn poll_slice(deadline: MonotonicTime) -> Option<Duration> {
    until(deadline).map(|remaining| remaining.min(POLL_QUANTUM))
}
