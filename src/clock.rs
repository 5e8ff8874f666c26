//! Time sources for time-bounded replay.
//!
//! A [`Clock`] reports elapsed time since its own origin. Only differences
//! between readings matter, so any monotonic source works.

use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

/// Monotonic time source.
pub trait Clock: Send + Sync + 'static {
  /// Time elapsed since this clock's origin.
  fn now(&self) -> Duration;
}

/// Wall-clock time backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
  origin: Instant,
}

impl SystemClock {
  pub fn new() -> Self { Self { origin: Instant::now() } }
}

impl Default for SystemClock {
  fn default() -> Self { Self::new() }
}

impl Clock for SystemClock {
  fn now(&self) -> Duration { self.origin.elapsed() }
}

/// A clock that only moves when told to.
///
/// Clones share the same reading, so a test can keep one handle and give the
/// other to a subject:
///
/// ```
/// use std::time::Duration;
/// use hotrx::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let shared = clock.clone();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(shared.now(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
  nanos: Arc<AtomicU64>,
}

impl ManualClock {
  pub fn new() -> Self { Self::default() }

  /// Move the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
    self.nanos.fetch_add(nanos, Ordering::AcqRel);
  }

  /// Jump to an absolute reading. Going backwards is allowed.
  pub fn set(&self, at: Duration) {
    let nanos = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
    self.nanos.store(nanos, Ordering::Release);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Duration { Duration::from_nanos(self.nanos.load(Ordering::Acquire)) }
}
