//! Transfer-ID tracking shared by the transport reassemblers

use crate::TransferId;

/// Tracks the last accepted transfer ID of one `(source, data specifier)`
/// pair and rejects old duplicates
///
/// A candidate more than `tolerance` steps behind the last accepted value is
/// treated as a replay of an old transfer and rejected; anything else
/// advances the window. The conventional tolerance is half the modulo.
#[derive(Debug, Clone)]
pub struct TransferIdTracker {
    last: Option<TransferId>,
    modulo: u64,
    tolerance: u64,
}

impl TransferIdTracker {
    /// Creates a tracker
    ///
    /// A modulo of 0 denotes the full 64-bit range.
    pub fn new(modulo: u64, tolerance: u64) -> Self {
        TransferIdTracker {
            last: None,
            modulo,
            tolerance,
        }
    }

    /// Half-modulo tolerance, the conventional default
    pub fn with_default_tolerance(modulo: u64) -> Self {
        let tolerance = if modulo == 0 {
            u64::MAX / 2
        } else {
            modulo / 2
        };
        Self::new(modulo, tolerance)
    }

    /// Checks a candidate transfer ID and, if acceptable, records it
    pub fn accept(&mut self, candidate: TransferId) -> bool {
        match self.last {
            None => {
                self.last = Some(candidate);
                true
            }
            Some(last) => {
                // Distance from the candidate forward to the last accepted
                // value; small distances mean the candidate lags behind.
                let lag = candidate.distance_to(last, self.modulo);
                if lag != 0 && lag <= self.tolerance {
                    false
                } else {
                    self.last = Some(candidate);
                    true
                }
            }
        }
    }

    /// Like [`accept`](Self::accept), but also rejects a candidate equal to
    /// the last accepted value
    ///
    /// Used where an equal transfer ID means a duplicate (completed-transfer
    /// dedup) rather than a restart of the transfer in progress.
    pub fn accept_strict(&mut self, candidate: TransferId) -> bool {
        if self.last == Some(candidate) {
            return false;
        }
        self.accept(candidate)
    }

    /// Whether [`accept_strict`](Self::accept_strict) would accept the
    /// candidate, without recording anything
    pub fn check_strict(&self, candidate: TransferId) -> bool {
        match self.last {
            None => true,
            Some(last) if last == candidate => false,
            Some(last) => {
                let lag = candidate.distance_to(last, self.modulo);
                !(lag != 0 && lag <= self.tolerance)
            }
        }
    }

    /// The last accepted transfer ID, if any
    pub fn last(&self) -> Option<TransferId> {
        self.last
    }

    /// Forgets the history, accepting whatever comes next
    pub fn reset(&mut self) {
        self.last = None;
    }
}
