//! Retry-on-unauthorized combinator shared by both lookup stages.
//!
//! Only `Outcome::Unauthorized` is retried. Every other outcome, and any
//! error from the call or the recovery, is returned immediately.

use crate::{error::EnrichResult, gateway::Outcome};

/// Result of a call wrapped in `with_auth_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried {
    /// The last outcome seen. Still `Unauthorized` if retries ran out.
    pub outcome:    Outcome,
    /// Recovery cycles performed (0..=max_retries).
    pub recoveries: u32,
}

impl Retried {
    pub fn exhausted(&self) -> bool {
        matches!(self.outcome, Outcome::Unauthorized { .. })
    }
}

/// Run `call`; on `Unauthorized` run `recover` and call again, at most
/// `max_retries` times.
pub fn with_auth_retry<C, R>(max_retries: u32, mut recover: R, mut call: C) -> EnrichResult<Retried>
where
    C: FnMut() -> EnrichResult<Outcome>,
    R: FnMut() -> EnrichResult<()>,
{
    let mut recoveries = 0;
    loop {
        let outcome = call()?;
        if !matches!(outcome, Outcome::Unauthorized { .. }) || recoveries >= max_retries {
            return Ok(Retried { outcome, recoveries });
        }
        recoveries += 1;
        log::warn!("Unauthorized; refreshing token (retry {recoveries}/{max_retries})");
        recover()?;
    }
}
