//! Deadline arithmetic for the scheduler's wait computations.

use std::time::{Duration, Instant};

/// A point in time the scheduler may wait until.
///
/// `DistantFuture` is the distinguished "no deadline" value: it compares
/// later than every concrete instant and converts to an unbounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deadline {
    /// A concrete wall-clock point.
    At(Instant),
    /// Later than every concrete instant.
    DistantFuture,
}

impl Deadline {
    /// A deadline `delay` from now.
    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Self::At(Instant::now() + delay)
    }

    /// Returns the earlier of two deadlines.
    #[must_use]
    pub fn earlier(self, other: Self) -> Self {
        self.min(other)
    }

    /// True if this deadline is at or before `now`.
    #[must_use]
    pub fn is_past(self, now: Instant) -> bool {
        match self {
            Self::At(at) => at <= now,
            Self::DistantFuture => false,
        }
    }

    /// Converts to a wait timeout relative to `now`.
    ///
    /// `None` means wait without bound; an elapsed deadline yields a zero
    /// timeout so the caller polls rather than blocks.
    #[must_use]
    pub fn timeout_from(self, now: Instant) -> Option<Duration> {
        match self {
            Self::At(at) => Some(at.saturating_duration_since(now)),
            Self::DistantFuture => None,
        }
    }

    /// Returns the concrete instant, if there is one.
    #[must_use]
    pub fn instant(self) -> Option<Instant> {
        match self {
            Self::At(at) => Some(at),
            Self::DistantFuture => None,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Self::At(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distant_future_orders_last() {
        let now = Instant::now();
        assert!(Deadline::At(now) < Deadline::DistantFuture);
        assert_eq!(
            Deadline::At(now).earlier(Deadline::DistantFuture),
            Deadline::At(now)
        );
    }

    #[test]
    fn test_elapsed_deadline_yields_zero_timeout() {
        let now = Instant::now();
        let past = Deadline::At(now - Duration::from_millis(5));
        assert_eq!(past.timeout_from(now), Some(Duration::ZERO));
        assert!(past.is_past(now));
        assert!(!Deadline::DistantFuture.is_past(now));
    }
}
