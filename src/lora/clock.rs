//! Time source and bounded polling.
//!
//! Every radio wait in the driver is a busy-poll on a register flag with a
//! wall-clock deadline. [`poll_until`] is the single implementation of that
//! loop; the [`Clock`] it runs against is injected so tests can use
//! [`ManualClock`] and hit every timeout path without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source with a blocking delay.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;

    /// Microseconds since the same origin.
    fn now_us(&self) -> u64;

    /// Block for `ms` milliseconds.
    fn delay_ms(&self, ms: u32);
}

/// Host clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn delay_ms(&self, ms: u32) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }
}

/// Fake clock that only moves when told to (or when someone delays on it).
///
/// Clones share the same time, so a test can keep a handle while the driver
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock already at `ms`.
    pub fn starting_at(ms: u64) -> Self {
        let clock = Self::new();
        clock.set_ms(ms);
        clock
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_us.store(ms * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst) / 1000
    }

    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn delay_ms(&self, ms: u32) {
        self.advance_ms(ms as u64);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn delay_ms(&self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// How a bounded poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a timed-out poll must be handled"]
pub enum PollOutcome {
    /// The predicate held before the deadline.
    Satisfied,
    /// The deadline passed first.
    TimedOut,
}

impl PollOutcome {
    pub fn is_satisfied(self) -> bool {
        self == Self::Satisfied
    }
}

/// Evaluate `predicate` until it returns `true` or `deadline_ms` passes.
///
/// The predicate is always evaluated at least once, and once more after the
/// deadline is observed, so a flag raised during the last delay is not lost.
/// Errors from the predicate abort the poll immediately.
pub fn poll_until<C, E, F>(
    clock: &C,
    deadline_ms: u64,
    interval_ms: u32,
    mut predicate: F,
) -> Result<PollOutcome, E>
where
    C: Clock + ?Sized,
    F: FnMut() -> Result<bool, E>,
{
    loop {
        if predicate()? {
            return Ok(PollOutcome::Satisfied);
        }
        if clock.now_ms() >= deadline_ms {
            return Ok(PollOutcome::TimedOut);
        }
        clock.delay_ms(interval_ms.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_on_delay() {
        let clock = ManualClock::new();
        clock.delay_ms(25);
        assert_eq!(clock.now_ms(), 25);
        assert_eq!(clock.now_us(), 25_000);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(1_000);
        let handle = clock.clone();
        handle.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
    }

    #[test]
    fn test_poll_satisfied_immediately() {
        let clock = ManualClock::new();
        let outcome: Result<_, ()> = poll_until(&clock, 10, 1, || Ok(true));
        assert_eq!(outcome, Ok(PollOutcome::Satisfied));
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_poll_times_out_at_deadline() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let outcome: Result<_, ()> = poll_until(&clock, 10, 1, || {
            calls += 1;
            Ok(false)
        });
        assert_eq!(outcome, Ok(PollOutcome::TimedOut));
        assert_eq!(clock.now_ms(), 10);
        assert_eq!(calls, 11);
    }

    #[test]
    fn test_poll_satisfied_after_some_time() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        let outcome: Result<_, ()> = poll_until(&clock, 100, 5, || Ok(handle.now_ms() >= 20));
        assert_eq!(outcome, Ok(PollOutcome::Satisfied));
        assert_eq!(clock.now_ms(), 20);
    }

    #[test]
    fn test_poll_propagates_errors() {
        let clock = ManualClock::new();
        let outcome = poll_until(&clock, 100, 1, || Err::<bool, _>("bus down"));
        assert_eq!(outcome, Err("bus down"));
    }

    #[test]
    fn test_std_clock_is_monotonic() {
        let clock = StdClock::new();
        let a = clock.now_us();
        clock.delay_ms(1);
        assert!(clock.now_us() > a);
    }
}
