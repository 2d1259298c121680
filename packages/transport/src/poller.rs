//! Readiness-interest types and the external event loop contract
//!
//! The channel never blocks and never polls; it registers descriptors and
//! interest changes with a caller-supplied [`Poller`] and is resumed through
//! [`Channel::on_ready`](crate::Channel::on_ready) when the loop reports
//! readiness. Suspension points are therefore exactly the interest changes
//! made through this trait.

use std::ops::BitOr;
use std::os::fd::RawFd;

/// Readiness interest bits registered with the event loop.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    #[must_use]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Result of applying a want/unwant pair to this interest set.
    #[must_use]
    pub fn apply(self, want: Interest, unwant: Interest) -> Interest {
        Interest((self.0 | want.0) & !unwant.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Readiness bits delivered by the event loop.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Readiness(u8);

impl Readiness {
    pub const NONE: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(1);
    pub const WRITABLE: Readiness = Readiness(2);
    pub const ERROR: Readiness = Readiness(4);

    #[must_use]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// The external readiness multiplexer the channel cooperates with.
///
/// `set_interest` edits the registered interest set: the new set is
/// `(current | want) & !unwant`. `inject` queues a synthetic readiness
/// delivery for a descriptor; it is used when the secure layer holds
/// already-decrypted bytes that must be redelivered even though the
/// underlying descriptor will not become readable again.
pub trait Poller {
    fn register(&mut self, fd: RawFd);
    fn unregister(&mut self, fd: RawFd);
    fn set_interest(&mut self, fd: RawFd, want: Interest, unwant: Interest);
    fn inject(&mut self, fd: RawFd, ready: Readiness);
}
