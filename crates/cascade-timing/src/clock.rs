use once_cell::sync::OnceCell;
use quanta::Clock;

static GLOBAL_CLOCK: OnceCell<Clock> = OnceCell::new();
static EPOCH: OnceCell<u64> = OnceCell::new();

/// Process-wide monotonic clock. First access fixes the epoch; every
/// `Instant` is measured from it.
#[inline]
pub fn global_clock() -> &'static Clock {
    GLOBAL_CLOCK.get_or_init(Clock::new)
}

#[inline]
pub(crate) fn epoch_raw() -> u64 {
    *EPOCH.get_or_init(|| global_clock().raw())
}

/// Microseconds elapsed since the process clock epoch.
#[inline]
pub(crate) fn now_micros() -> u64 {
    let clock = global_clock();
    clock.delta_as_nanos(epoch_raw(), clock.raw()) / 1_000
}
