//! Signed durations and the monotonic clock seam.
//!
//! The timer queue stores *relative* delays that may legitimately go
//! negative (an overdue head entry after a refresh), so the crate uses a
//! signed nanosecond `Delta` throughout instead of `std::time::Duration`.

use core::fmt;
use core::ops::{Add, AddAssign, Neg, Sub, SubAssign};

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// A signed span of time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Delta(i64);

impl Delta {
    /// The zero span.
    pub const ZERO: Self = Self(0);

    /// Creates a delta from raw nanoseconds.
    #[inline]
    #[must_use]
    pub const fn from_nanos(value: i64) -> Self {
        Self(value)
    }

    /// Creates a delta from milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(value: i64) -> Self {
        Self(value * NANOS_PER_MILLI)
    }

    /// Creates a delta from whole seconds.
    #[inline]
    #[must_use]
    pub const fn from_secs(value: i64) -> Self {
        Self(value * NANOS_PER_SEC)
    }

    /// Creates a delta from fractional seconds (rounds toward zero).
    #[inline]
    #[must_use]
    pub fn from_secs_f64(value: f64) -> Self {
        Self((value * NANOS_PER_SEC as f64) as i64)
    }

    /// Returns the raw nanosecond count.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Returns the span as fractional seconds.
    #[inline]
    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    /// Returns `true` if the span is zero or negative (a due deadline).
    #[inline]
    #[must_use]
    pub const fn is_due(self) -> bool {
        self.0 <= 0
    }

    /// Converts to an unsigned [`std::time::Duration`], clamping negative
    /// spans to zero. Used when handing a wait budget to a blocking
    /// primitive that rejects negative timeouts.
    #[inline]
    #[must_use]
    pub fn clamped_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.max(0) as u64)
    }
}

impl Add for Delta {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Delta {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Delta {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Delta {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Delta {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Source of monotonic time for the timer queue.
///
/// The production clock is [`MonoClock`]; tests substitute a manually
/// advanced clock so schedules can be driven in virtual time.
pub trait Clock {
    /// Nanoseconds elapsed since an arbitrary fixed epoch. Must be
    /// monotonically non-decreasing.
    fn now_ns(&self) -> u64;
}

/// Monotonic wall-clock backed by [`minstant`].
#[derive(Debug, Clone)]
pub struct MonoClock {
    anchor: minstant::Instant,
}

impl MonoClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: minstant::Instant::now(),
        }
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonoClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_arithmetic_is_signed() {
        let a = Delta::from_millis(5);
        let b = Delta::from_millis(8);
        assert_eq!((a - b).as_nanos(), -3 * 1_000_000);
        assert!((a - b).is_due());
        assert!(!(b - a).is_due());
        assert_eq!(-(a - b), b - a);
    }

    #[test]
    fn clamped_std_floors_negative_spans() {
        assert_eq!(
            Delta::from_millis(-7).clamped_std(),
            std::time::Duration::ZERO
        );
        assert_eq!(
            Delta::from_millis(7).clamped_std(),
            std::time::Duration::from_millis(7)
        );
    }

    #[test]
    fn mono_clock_does_not_go_backwards() {
        let clock = MonoClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
