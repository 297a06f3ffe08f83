//! Injectable clock pair.
//!
//! Two sources, never mixed: `epoch_now` produces wall-clock
//! milliseconds for externally-visible telemetry, `monotonic_now`
//! produces durations from an arbitrary origin for ordering and
//! elapsed-time math. Nothing in this crate converts one into the
//! other.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type EpochFn = Arc<dyn Fn() -> i64 + Send + Sync>;
type MonoFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Clock handle cloned into every component that needs time.
#[derive(Clone)]
pub struct Clock {
    epoch: EpochFn,
    mono: MonoFn,
}

impl Clock {
    /// Wall clock from `chrono`, monotonic from a process-local `Instant` origin.
    pub fn system() -> Self {
        let origin = Instant::now();
        Self {
            epoch: Arc::new(|| chrono::Utc::now().timestamp_millis()),
            mono: Arc::new(move || origin.elapsed()),
        }
    }

    /// Build a clock from two injected functions.
    pub fn new<E, M>(epoch: E, mono: M) -> Self
    where
        E: Fn() -> i64 + Send + Sync + 'static,
        M: Fn() -> Duration + Send + Sync + 'static,
    {
        Self {
            epoch: Arc::new(epoch),
            mono: Arc::new(mono),
        }
    }

    /// Wall-clock milliseconds since the Unix epoch.
    #[inline]
    pub fn epoch_now(&self) -> i64 {
        (self.epoch)()
    }

    /// Monotonic duration since an arbitrary, fixed origin.
    #[inline]
    pub fn monotonic_now(&self) -> Duration {
        (self.mono)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Clock")
    }
}

/// Hand-driven clock for deterministic tests and embeddings that
/// control time themselves. Both sources advance only when told to.
#[derive(Debug)]
pub struct ManualClock {
    epoch_ms: AtomicI64,
    mono_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            epoch_ms: AtomicI64::new(epoch_start_ms),
            mono_ns: AtomicU64::new(0),
        })
    }

    /// Advance both sources by `d`.
    pub fn advance(&self, d: Duration) {
        self.epoch_ms
            .fetch_add(d.as_millis() as i64, Ordering::AcqRel);
        self.mono_ns.fetch_add(d.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms.load(Ordering::Acquire)
    }

    pub fn mono(&self) -> Duration {
        Duration::from_nanos(self.mono_ns.load(Ordering::Acquire))
    }

    /// A `Clock` backed by this instance.
    pub fn clock(self: &Arc<Self>) -> Clock {
        let a = self.clone();
        let b = self.clone();
        Clock::new(move || a.epoch_ms(), move || b.mono())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_monotonic_is_non_decreasing() {
        let clock = Clock::system();
        let a = clock.monotonic_now();
        let b = clock.monotonic_now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_both_sources() {
        let manual = ManualClock::new(1_000);
        let clock = manual.clock();

        assert_eq!(clock.epoch_now(), 1_000);
        assert_eq!(clock.monotonic_now(), Duration::ZERO);

        manual.advance(Duration::from_millis(250));
        assert_eq!(clock.epoch_now(), 1_250);
        assert_eq!(clock.monotonic_now(), Duration::from_millis(250));
    }

    #[test]
    fn injected_functions_are_used_verbatim() {
        let clock = Clock::new(|| 42, || Duration::from_secs(7));
        assert_eq!(clock.epoch_now(), 42);
        assert_eq!(clock.monotonic_now(), Duration::from_secs(7));
    }
}
