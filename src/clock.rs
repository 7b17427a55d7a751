use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of timestamps for the queue stores.
///
/// Every poll takes exactly one reading and uses it for all visibility
/// decisions in that call.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

/// Wall-clock time via `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        wall_clock_ns()
    }
}

/// Cheap monotonic readings for busy poll loops.
///
/// Reads the wall clock once, when built, and adds the `quanta` tick count
/// elapsed since. Readings never go backwards, but they can drift away from
/// wall time over a long-running process; use [`SystemClock`] where pipe
/// timestamps must line up with other writers.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    ticks: quanta::Clock,
    anchor_ns: u64,
    anchor: quanta::Instant,
}

impl QuantaClock {
    pub fn new() -> Self {
        let ticks = quanta::Clock::new();
        let anchor = ticks.now();
        Self {
            ticks,
            anchor_ns: wall_clock_ns(),
            anchor,
        }
    }
}

impl Default for QuantaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let since_anchor = self.ticks.now().saturating_duration_since(self.anchor);
        let since_anchor = u64::try_from(since_anchor.as_nanos()).unwrap_or(u64::MAX);
        self.anchor_ns.saturating_add(since_anchor)
    }
}

/// A clock that only moves when told to. Used to drive visibility timeouts
/// deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Starts at the current wall-clock second.
    pub fn starting_now() -> Self {
        let ns = wall_clock_ns();
        Self::new(ns - ns % 1_000_000_000)
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

// Pre-epoch system time reads as 0 rather than panicking.
fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_nanos(500));
        assert_eq!(clock.now(), 1_500);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn quanta_clock_is_monotonic() {
        let clock = QuantaClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 0);
    }
}
