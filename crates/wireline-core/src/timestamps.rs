//! Monotonic client-side timestamp generation.
//!
//! Outgoing writes are stamped with a client timestamp in microseconds. The
//! generator returns the wall clock when it advances, but if the clock stalls
//! or runs backward it drifts into the future by single-microsecond increments
//! and logs rate-limited warnings, so every returned value is strictly greater
//! than every value returned before it.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock readings in microseconds since the Unix epoch.
///
/// Injected so tests can script the clock.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct GeneratorState {
    /// Highest value ever returned.
    last: u64,
    /// Clock reading at the time of the last drift warning.
    last_warn: u64,
}

/// Process-wide (or per-client) monotonically increasing microsecond clock.
///
/// Every call to [`next_timestamp`](Self::next_timestamp) returns a value
/// strictly greater than every previously returned value from the same
/// instance, regardless of how many threads call concurrently. The whole
/// read-compare-update sequence runs under one lock, and that lock is
/// independent of any connection lock.
pub struct MonotonicTimestampGenerator {
    clock: Box<dyn Clock>,
    state: Mutex<GeneratorState>,
    warn_on_drift: bool,
    warning_threshold: Duration,
    warning_interval: Duration,
}

impl std::fmt::Debug for MonotonicTimestampGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicTimestampGenerator")
            .field("warn_on_drift", &self.warn_on_drift)
            .field("warning_threshold", &self.warning_threshold)
            .field("warning_interval", &self.warning_interval)
            .finish_non_exhaustive()
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicTimestampGenerator {
    /// Create a generator backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create a generator with an injected clock source.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            state: Mutex::new(GeneratorState {
                last: 0,
                last_warn: 0,
            }),
            warn_on_drift: true,
            warning_threshold: Duration::from_secs(1),
            warning_interval: Duration::from_secs(1),
        }
    }

    /// Disable drift warnings entirely.
    pub fn warn_on_drift(mut self, enabled: bool) -> Self {
        self.warn_on_drift = enabled;
        self
    }

    /// How far ahead of the wall clock the generator may drift before warning.
    pub fn warning_threshold(mut self, threshold: Duration) -> Self {
        self.warning_threshold = threshold;
        self
    }

    /// Minimum spacing between drift warnings.
    pub fn warning_interval(mut self, interval: Duration) -> Self {
        self.warning_interval = interval;
        self
    }

    /// Return the next timestamp in microseconds.
    ///
    /// Returns the wall clock when it has advanced past the last returned
    /// value; otherwise returns `last + 1`. A clock reading exactly equal to
    /// `last` counts as not advanced. Never fails: drift is observability
    /// only.
    pub fn next_timestamp(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now_micros();
        if now > state.last {
            state.last = now;
            now
        } else {
            self.maybe_warn(&mut state, now);
            state.last += 1;
            state.last
        }
    }

    /// Called under the state lock when the clock did not advance.
    fn maybe_warn(&self, state: &mut GeneratorState, now: u64) {
        if !self.warn_on_drift {
            return;
        }
        let drift = state.last.saturating_sub(now);
        if drift <= self.warning_threshold.as_micros() as u64 {
            return;
        }
        if now.saturating_sub(state.last_warn) < self.warning_interval.as_micros() as u64
            && state.last_warn != 0
        {
            return;
        }
        tracing::warn!(
            now_micros = now,
            last_micros = state.last,
            drift_micros = drift,
            "Clock skew detected: current tick is behind the last generated \
             timestamp; returned timestamps will be artificially incremented \
             to guarantee monotonicity"
        );
        state.last_warn = now;
    }
}
