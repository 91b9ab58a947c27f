use crate::{Duration, Instant};

/// Fires at most once per interval; the first check after construction (or
/// [`Self::force_fire`]) fires immediately. Head filters and periodic
/// diagnostics use this to act on wall time without busy looping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Repeater {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_fired: None }
    }

    /// True once per elapsed interval; arms the next one.
    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.is_due() {
            self.last_fired = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Runs `f` with the elapsed time when the interval has passed.
    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(Duration),
    {
        if self.is_due() {
            f(self.last_fired.map_or(Duration::ZERO, Instant::elapsed));
            self.last_fired = Some(Instant::now());
        }
    }

    /// Time until the next firing; zero when due.
    #[inline]
    pub fn until_next(&self) -> Duration {
        match self.last_fired {
            Some(at) => self.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    #[inline]
    fn is_due(&self) -> bool {
        self.last_fired.is_none_or(|at| at.elapsed() >= self.interval)
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Starts a full interval from now.
    pub fn reset(&mut self) {
        self.last_fired = Some(Instant::now());
    }

    /// Makes the next check fire regardless of elapsed time.
    pub fn force_fire(&mut self) {
        self.last_fired = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_call_fires() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        assert!(r.fired());
        assert!(!r.fired());
    }

    #[test]
    fn force_fire_rearms() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        assert!(r.fired());
        r.force_fire();
        assert!(r.fired());
    }

    #[test]
    fn reset_defers_the_first_firing() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        r.reset();
        assert!(!r.fired());
        assert!(r.until_next() > Duration::ZERO);
    }

    #[test]
    fn until_next_counts_down() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        assert_eq!(r.until_next(), Duration::ZERO);
        assert!(r.fired());
        assert!(r.until_next() > Duration::ZERO);
    }

    #[test]
    fn short_interval_fires_again() {
        let mut r = Repeater::every(Duration::ZERO);
        assert!(r.fired());
        assert!(r.fired());
    }
}
