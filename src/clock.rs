//! Time source for expiry decisions.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Something that can tell the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// Current time as epoch milliseconds, the unit stored in cache envelopes.
  fn now_millis(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}
