//! Readiness masks and send/recv flags.
//!
//! Values match libzmq (`ZMQ_POLLIN`, `ZMQ_POLLOUT`, `ZMQ_DONTWAIT`, `ZMQ_SNDMORE`)
//! so they can be handed to a libzmq socket unchanged.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Do not block: fail with `WouldBlock` instead (`ZMQ_DONTWAIT`).
pub const DONTWAIT: i32 = 1;

/// More frames of the same message follow (`ZMQ_SNDMORE`).
pub const SNDMORE: i32 = 2;

/// A set of readiness conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u8);

impl Events {
    /// A message can be received without blocking (`POLLIN`).
    pub const READABLE: Self = Self(1);
    /// A message can be sent without blocking (`POLLOUT`).
    pub const WRITABLE: Self = Self(2);
    /// Both directions.
    pub const ALL: Self = Self(3);

    /// The empty mask.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a mask from raw `POLLIN`/`POLLOUT` bits, ignoring anything else.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self((bits & 3) as u8)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    /// Iterate the event kinds present in this mask.
    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.mask()))
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Events {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Events {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl From<EventKind> for Events {
    fn from(kind: EventKind) -> Self {
        kind.mask()
    }
}

impl fmt::Display for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "POLLIN"),
            (false, true) => write!(f, "POLLOUT"),
            (true, true) => write!(f, "POLLIN|POLLOUT"),
        }
    }
}

/// The direction a caller waits for. Wait gates are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Readable,
    Writable,
}

impl EventKind {
    pub const ALL: [Self; 2] = [Self::Readable, Self::Writable];

    #[inline]
    pub const fn mask(self) -> Events {
        match self {
            Self::Readable => Events::READABLE,
            Self::Writable => Events::WRITABLE,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Readable => "readable",
            Self::Writable => "writable",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
