//! Event handler contract for the socket engine
//!
//! Anything that owns a pollable descriptor implements [`EventHandler`]
//! and registers itself with the socket engine together with an
//! [`EventMask`] describing how it wants to be notified.

use crate::server::Core;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// Desired readiness notifications for one descriptor.
///
/// The mask encodes a notification *strategy* per direction:
///
/// - `POLL_*` — level-triggered, notified every dispatch until drained
/// - `FAST_*` — one-shot, notified at the next opportunity then cleared
/// - `EDGE_*` — edge-triggered, notified on the 0→ready transition only
///
/// `READ_WILL_BLOCK` / `WRITE_WILL_BLOCK` record that the last attempt
/// returned EAGAIN; the engine clears them when it delivers the
/// corresponding readiness event.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const POLL_READ: EventMask = EventMask(1 << 0);
    pub const POLL_WRITE: EventMask = EventMask(1 << 1);
    pub const FAST_READ: EventMask = EventMask(1 << 2);
    pub const FAST_WRITE: EventMask = EventMask(1 << 3);
    pub const EDGE_READ: EventMask = EventMask(1 << 4);
    pub const EDGE_WRITE: EventMask = EventMask(1 << 5);
    pub const READ_WILL_BLOCK: EventMask = EventMask(1 << 6);
    pub const WRITE_WILL_BLOCK: EventMask = EventMask(1 << 7);

    /// True if every bit of `other` is present in `self`
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is present in `self`
    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// `self` with the bits of `other` removed
    pub fn without(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (EventMask::POLL_READ, "POLL_READ"),
            (EventMask::POLL_WRITE, "POLL_WRITE"),
            (EventMask::FAST_READ, "FAST_READ"),
            (EventMask::FAST_WRITE, "FAST_WRITE"),
            (EventMask::EDGE_READ, "EDGE_READ"),
            (EventMask::EDGE_WRITE, "EDGE_WRITE"),
            (EventMask::READ_WILL_BLOCK, "READ_WILL_BLOCK"),
            (EventMask::WRITE_WILL_BLOCK, "WRITE_WILL_BLOCK"),
        ];
        let mut first = true;
        write!(f, "EventMask(")?;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        write!(f, ")")
    }
}

/// A pollable descriptor registered with the socket engine.
///
/// Callbacks receive the shared [`Core`] context. The event mask field
/// is written only by the engine; handlers request changes through
/// [`crate::engine::SocketEngine::set_mask`].
pub trait EventHandler {
    /// The OS descriptor this handler owns
    fn fd(&self) -> RawFd;

    /// The current event mask
    fn event_mask(&self) -> EventMask;

    /// Overwrite the event mask. Only the socket engine calls this.
    fn set_event_mask(&mut self, mask: EventMask);

    /// The descriptor is readable
    fn on_readable(&mut self, core: &Core);

    /// The descriptor is writable
    fn on_writable(&mut self, _core: &Core) {}

    /// An error condition was raised for the descriptor. Hang-up is
    /// delivered with `code` 0.
    fn on_error(&mut self, _core: &Core, _code: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_set_algebra() {
        let mask = EventMask::POLL_READ | EventMask::FAST_WRITE;
        assert!(mask.contains(EventMask::POLL_READ));
        assert!(mask.intersects(EventMask::FAST_WRITE | EventMask::EDGE_READ));
        assert!(!mask.contains(EventMask::POLL_READ | EventMask::EDGE_READ));
        assert!(mask.without(EventMask::POLL_READ | EventMask::FAST_WRITE).is_empty());
        assert_eq!(mask.without(EventMask::EDGE_READ), mask);
    }

    #[test]
    fn mask_debug_names_bits() {
        let mask = EventMask::POLL_READ | EventMask::READ_WILL_BLOCK;
        let rendered = format!("{:?}", mask);
        assert!(rendered.contains("POLL_READ"));
        assert!(rendered.contains("READ_WILL_BLOCK"));
        assert_eq!(format!("{:?}", EventMask::NONE), "EventMask(NONE)");
    }
}
