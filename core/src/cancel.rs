//! Cooperative cancellation shared by every worker of a run.
//!
//! Blocking waits (rate-limit suspension) park on the token's condvar,
//! so `cancel()` wakes them immediately instead of after the window.

use crate::error::{EnrichError, EnrichResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake:      Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut flag = self.inner.cancelled.lock();
        *flag = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Clear a consumed cancellation so the same token can drive another run.
    pub fn reset(&self) {
        *self.inner.cancelled.lock() = false;
    }

    /// `Err(Cancelled)` once `cancel()` has been called.
    pub fn check(&self) -> EnrichResult<()> {
        if self.is_cancelled() {
            Err(EnrichError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block for `dur` or until cancelled, whichever comes first.
    pub fn wait(&self, dur: Duration) -> EnrichResult<()> {
        let deadline = Instant::now() + dur;
        let mut flag = self.inner.cancelled.lock();
        while !*flag {
            if self.inner.wake.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        if *flag {
            Err(EnrichError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
