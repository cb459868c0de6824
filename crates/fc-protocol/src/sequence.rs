//! Frame sequence numbers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates a pushed command with the agent responses it produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sequence(pub u32);

impl Sequence {
    /// Create a new sequence number
    pub fn new(seq: u32) -> Self {
        Self(seq)
    }

    /// Get the raw value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Sequence used for frames not tied to a command (registration, heartbeats)
    pub const CONTROL: Sequence = Sequence(0);

    /// The sequence after this one, skipping `CONTROL` on wrap-around
    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Sequence(1),
            n => Sequence(n),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

impl From<u32> for Sequence {
    fn from(seq: u32) -> Self {
        Self(seq)
    }
}
