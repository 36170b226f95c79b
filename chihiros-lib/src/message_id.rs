use crate::constants::SENTINEL;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-byte rolling sequence number carried in every frame.
///
/// Incremented low byte first with carry into the high byte. Neither byte
/// ever takes the sentinel value `0x5A`; it is skipped on the way past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageId {
    pub hi: u8,
    pub lo: u8,
}

impl MessageId {
    pub const fn new(hi: u8, lo: u8) -> Self {
        Self { hi, lo }
    }

    /// The id that follows `self`.
    pub fn next(self) -> Self {
        let mut hi = self.hi;
        let mut lo = self.lo.wrapping_add(1);
        if lo == SENTINEL {
            lo = lo.wrapping_add(1);
        }
        if lo == 0 {
            hi = hi.wrapping_add(1);
            if hi == SENTINEL {
                hi = hi.wrapping_add(1);
            }
        }
        Self { hi, lo }
    }

    /// The first sentinel-free id at or after `self` in sequence order.
    pub fn normalized(self) -> Self {
        match (self.hi, self.lo) {
            (SENTINEL, _) => Self::new(SENTINEL.wrapping_add(1), 0),
            (hi, SENTINEL) => Self::new(hi, SENTINEL.wrapping_add(1)),
            _ => self,
        }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.hi, self.lo]
    }

    pub fn contains_sentinel(self) -> bool {
        self.hi == SENTINEL || self.lo == SENTINEL
    }
}

impl From<(u8, u8)> for MessageId {
    fn from((hi, lo): (u8, u8)) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.hi, self.lo)
    }
}

/// Per-session message-id counter.
///
/// Holds the last id handed out; [`MessageIdCounter::advance`] returns the
/// successor and remembers it. Frames built with a later id (checksum
/// rotation) are folded back with [`MessageIdCounter::observe`].
#[derive(Debug, Clone, Default)]
pub struct MessageIdCounter {
    last: MessageId,
}

impl MessageIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_after(last: MessageId) -> Self {
        Self { last }
    }

    pub fn current(&self) -> MessageId {
        self.last
    }

    pub fn advance(&mut self) -> MessageId {
        self.last = self.last.next();
        self.last
    }

    /// Record an id actually emitted on the wire.
    pub fn observe(&mut self, used: MessageId) {
        self.last = used;
    }
}
