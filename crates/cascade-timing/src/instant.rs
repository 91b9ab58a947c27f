use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::{Duration, clock::now_micros};

/// A point on the process-global monotonic clock, in microseconds since the
/// clock epoch. Presentation timestamps and scheduler wake times share this
/// time base.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(C)]
pub struct Instant(pub u64);

impl Instant {
    pub const MAX: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn now() -> Self {
        Instant(now_micros())
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn elapsed(self) -> Duration {
        Instant::now().saturating_since(self)
    }

    /// Time from `earlier` up to `self`; zero if `earlier` is in the future.
    #[inline]
    pub fn saturating_since(self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    /// Time still to pass until `self`; zero once reached.
    #[inline]
    pub fn remaining(self) -> Duration {
        self.saturating_since(Instant::now())
    }

    #[inline]
    pub fn is_reached(self) -> bool {
        self <= Instant::now()
    }
}

impl Sub for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_since(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
    }

    #[test]
    fn arithmetic() {
        let t = Instant(1_000);
        assert_eq!(t + Duration(500), Instant(1_500));
        assert_eq!(t - Duration(2_000), Instant::ZERO);
        assert_eq!(Instant(3_000) - t, Duration(2_000));
        assert_eq!(t - Instant(3_000), Duration::ZERO);
    }

    #[test]
    fn reached_and_remaining() {
        assert!(Instant::ZERO.is_reached());
        assert!(!Instant::MAX.is_reached());
        assert_eq!(Instant::ZERO.remaining(), Duration::ZERO);
        assert!(Instant::MAX.remaining() > Duration::ZERO);
    }
}
