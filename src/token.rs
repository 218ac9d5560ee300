//! Completion tokens and frame numbers.
//!
//! Two monotonic counters drive resource reuse in the core:
//!
//! - [`CompletionToken`]: the fence value a [`CommandQueue`](crate::CommandQueue)
//!   signals after each submission.
//! - [`FrameNumber`]: the engine frame counter stamped on freed descriptor
//!   blocks, compared against by
//!   [`release_stale_descriptors`](crate::GpuContext::release_stale_descriptors).
//!
//! They are distinct types so a fence value can never be compared against a
//! frame count by accident.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fence value signalled by a queue once a submission has been executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompletionToken(u64);

impl CompletionToken {
    /// Token that is complete before anything has been submitted.
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw fence value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fence#{}", self.0)
    }
}

/// Engine frame counter used to retire freed descriptor blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Shared source of the current [`FrameNumber`].
///
/// Descriptor allocations read it when they are dropped, so the renderer
/// only has to advance it once per frame.
#[derive(Debug, Default)]
pub struct FrameClock {
    current: AtomicU64,
}

impl FrameClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn current(&self) -> FrameNumber {
        FrameNumber(self.current.load(Ordering::Acquire))
    }

    /// Move to the next frame and return it.
    pub fn advance(&self) -> FrameNumber {
        FrameNumber(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Jump to `frame`. Used when the renderer owns its own frame counter.
    pub fn set(&self, frame: FrameNumber) {
        self.current.store(frame.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_clock_advances_monotonically() {
        let clock = FrameClock::new();
        assert_eq!(clock.current(), FrameNumber::new(0));
        assert_eq!(clock.advance(), FrameNumber::new(1));
        assert_eq!(clock.advance(), FrameNumber::new(2));
        clock.set(FrameNumber::new(10));
        assert_eq!(clock.current(), FrameNumber::new(10));
    }

    #[test]
    fn test_completion_token_ordering() {
        let a = CompletionToken::new(3);
        assert!(a < a.next());
        assert!(CompletionToken::ZERO <= a);
    }
}
