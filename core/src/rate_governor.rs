//! Request-rate ceiling shared by every worker in the process.
//!
//! RULE: every partner call passes through `admit()` first.
//! The ceiling depends on local time-of-day and is re-read on every
//! call, so a run that crosses a boundary switches ceilings mid-run.

use crate::{cancel::CancelToken, clock::Clock, error::EnrichResult};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub peak_start_hour:  u32,
    pub peak_end_hour:    u32,
    pub peak_ceiling:     u32,
    pub off_peak_ceiling: u32,
    pub window:           Duration,
}

impl RatePolicy {
    pub fn ceiling_at(&self, time: NaiveTime) -> u32 {
        let hour = time.hour();
        if hour >= self.peak_start_hour && hour < self.peak_end_hour {
            self.peak_ceiling
        } else {
            self.off_peak_ceiling
        }
    }
}

#[derive(Debug)]
struct Window {
    count:   u32,
    started: NaiveDateTime,
}

pub struct RateGovernor {
    policy: RatePolicy,
    clock:  Arc<dyn Clock>,
    window: Mutex<Window>,
}

impl RateGovernor {
    pub fn new(policy: RatePolicy, clock: Arc<dyn Clock>) -> Self {
        let started = clock.now();
        Self {
            policy,
            clock,
            window: Mutex::new(Window { count: 0, started }),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Block until one more request may be issued, then count it.
    pub fn admit(&self, cancel: &CancelToken) -> EnrichResult<()> {
        loop {
            cancel.check()?;
            let wait = {
                let mut w = self.window.lock();
                let now = self.clock.now();
                let elapsed = (now - w.started).to_std().unwrap_or(Duration::ZERO);
                // Negative elapsed means the wall clock moved backwards.
                if elapsed >= self.policy.window || now < w.started {
                    w.count = 0;
                    w.started = now;
                }
                let ceiling = self.policy.ceiling_at(now.time());
                if w.count < ceiling {
                    if w.count == 0 {
                        w.started = now;
                    }
                    w.count += 1;
                    return Ok(());
                }
                self.policy.window.saturating_sub(elapsed)
            };
            log::info!(
                "Rate ceiling reached; suspending for {:.1}s",
                wait.as_secs_f64()
            );
            self.clock.sleep(wait, cancel)?;
        }
    }

    /// Requests counted in the current window.
    pub fn issued_in_window(&self) -> u32 {
        self.window.lock().count
    }
}
