//! Wall clock used by the rate governor.
//!
//! RULE: nothing in the request path reads the system time directly.
//! The governor asks its Clock, so tests can drive time by hand.

use crate::{cancel::CancelToken, error::EnrichResult};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use parking_lot::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    /// Suspend the caller for `dur`. Returns `Err(Cancelled)` if the
    /// token fires first.
    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> EnrichResult<()>;
}

/// The real clock: local time, real sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> EnrichResult<()> {
        cancel.wait(dur)
    }
}

/// Hand-driven clock. `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    now:    Mutex<NaiveDateTime>,
    slept:  Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now:   Mutex::new(start),
            slept: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, dur: Duration) {
        let mut now = self.now.lock();
        *now += ChronoDuration::from_std(dur).unwrap_or(ChronoDuration::zero());
    }

    /// Every suspension requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }

    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> EnrichResult<()> {
        cancel.check()?;
        self.slept.lock().push(dur);
        self.advance(dur);
        Ok(())
    }
}
