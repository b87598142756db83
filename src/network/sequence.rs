//! Receive-side sequence tracking.
//!
//! Classifies each packet from a peer against the highest sequence seen so
//! far. Loss and reordering are reported, never repaired: retransmission and
//! reordering policy belong to higher layers.

use serde::{Serialize, Deserialize};

const HALF_RANGE: u32 = u32::MAX / 2;

/// Returns whether `s1` is more recent than `s2`, allowing for wrap-around.
///
/// `sequence_greater_than(2, 1)` is true, `sequence_greater_than(1, u32::MAX)`
/// is true, `sequence_greater_than(1, 1)` is false.
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

/// How a received packet relates to what came before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketOrder {
    /// First packet seen from this peer.
    First,
    /// Exactly one past the newest packet seen.
    InOrder,
    /// Newer than expected; `missing` packets were skipped (lost or late).
    Gap {
        /// Number of sequence numbers skipped.
        missing: u32,
    },
    /// Not newer than the newest packet seen (reordered or duplicated).
    Late,
}

/// Highest sequence seen from one peer.
#[derive(Clone, Debug, Default)]
pub struct SequenceTracker {
    newest: Option<u32>,
}

impl SequenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest sequence observed so far.
    pub fn newest(&self) -> Option<u32> {
        self.newest
    }

    /// Record a received sequence number and classify it.
    pub fn observe(&mut self, sequence: u32) -> PacketOrder {
        let newest = match self.newest {
            None => {
                self.newest = Some(sequence);
                return PacketOrder::First;
            }
            Some(newest) => newest,
        };

        if !sequence_greater_than(sequence, newest) {
            return PacketOrder::Late;
        }

        self.newest = Some(sequence);
        match sequence.wrapping_sub(newest) {
            1 => PacketOrder::InOrder,
            step => PacketOrder::Gap { missing: step - 1 },
        }
    }
}
