//! Time source for the reconciler and the orchestrator
//!
//! Wait checks, analysis timestamps and status transition times all read the
//! current instant through `Clock`, so tests can step a release through its
//! intervals without sleeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Trait for getting the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock handle shared between the reconciler and facade
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant
///
/// Used by plan simulation so identical input always renders the same plan.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Manually advanced clock for tests
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
