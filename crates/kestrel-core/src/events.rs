//! Interest/readiness mask for reactor registrations
//!
//! A registration's interest is the union of `READ` and `WRITE`; `ERR` is
//! reported by the reactor but never requested. Hangup is folded into
//! `READ` so callers observe it as readable-to-EOF.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Union of per-fd event bits
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(1 << 0);
    pub const WRITE: EventSet = EventSet(1 << 1);
    pub const ERR: EventSet = EventSet(1 << 2);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Clear the given bits, returning the residual mask
    #[inline]
    #[must_use]
    pub const fn remove(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    #[inline]
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut sep = "";
        for (bit, name) in [
            (EventSet::READ, "READ"),
            (EventSet::WRITE, "WRITE"),
            (EventSet::ERR, "ERR"),
        ] {
            if self.contains(bit) {
                write!(f, "{}{}", sep, name)?;
                sep = "|";
            }
        }
        Ok(())
    }
}
