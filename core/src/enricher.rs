//! The enrichment orchestrator. Drives both lookup stages per subject.
//!
//! Stage 1 resolves relationship ids for a subject; stage 2 fetches limit
//! details for each resolved link. Both stages share one recovery path:
//! on 401 the token is invalidated and refreshed (once per burst of
//! concurrent rejections), then the call is retried, up to
//! `max_auth_retries` times.
//!
//! RULES:
//!   - Every subject that reaches stage 1 ends with link rows or exactly
//!     one failure report, never both.
//!   - Every link fed to stage 2 ends with limit rows or exactly one
//!     failure report.
//!   - Only database errors and cancellation escape a subject; everything
//!     else becomes a failure report.

use crate::{
    cancel::CancelToken,
    error::{EnrichError, EnrichResult},
    gateway::{ApiGateway, Outcome},
    payload::{self, LimitRows, Linkage},
    retry::{with_auth_retry, Retried},
    store::EnrichStore,
    token::TokenManager,
    types::{RelationshipLink, Subject},
};
use std::cell::Cell;
use std::sync::Arc;

pub const NO_LINKAGE_MESSAGE: &str = "idConvenio not found";
pub const NO_LIMITS_MESSAGE: &str = "no limit details returned";

/// Terminal state of stage 1 for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectState {
    Resolved(Vec<RelationshipLink>),
    NoLinkage,
    Failed,
}

/// Terminal state of stage 2 for one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    Resolved { rows: usize },
    Failed,
}

/// Per-batch counters, for logging only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub resolved:      usize,
    pub no_linkage:    usize,
    pub failed:        usize,
    pub limit_rows:    usize,
    pub limit_failed:  usize,
}

impl BatchTally {
    pub fn absorb(&mut self, other: BatchTally) {
        self.resolved += other.resolved;
        self.no_linkage += other.no_linkage;
        self.failed += other.failed;
        self.limit_rows += other.limit_rows;
        self.limit_failed += other.limit_failed;
    }
}

pub struct Enricher {
    gateway:          Arc<ApiGateway>,
    tokens:           Arc<TokenManager>,
    base_url:         String,
    max_auth_retries: u32,
}

impl Enricher {
    pub fn new(
        gateway: Arc<ApiGateway>,
        tokens: Arc<TokenManager>,
        base_url: &str,
        max_auth_retries: u32,
    ) -> Self {
        Self {
            gateway,
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_auth_retries,
        }
    }

    pub fn relationship_url(&self, cpf: &str) -> String {
        format!("{}/consignado/v1/cliente/consulta-cpf?cpfRequest={cpf}", self.base_url)
    }

    pub fn limit_url(&self, cpf: &str, relationship_id: &str) -> String {
        format!("{}/consignado/v1/limite/consultar/{cpf}/{relationship_id}", self.base_url)
    }

    // ── Stage 1 ────────────────────────────────────────────────

    pub fn resolve_subject(
        &self,
        store: &EnrichStore,
        subject: &Subject,
        cancel: &CancelToken,
    ) -> EnrichResult<SubjectState> {
        let cpf = subject.id.as_str();
        let retried = self.authorized_call(&self.relationship_url(cpf), cancel)?;

        let payload = match retried.outcome {
            Outcome::Payload(json) => json,
            ref other => {
                log::warn!("Stage 1 failed for {cpf}: {}", other.describe());
                store.append_failure_report(cpf, None, &other.describe())?;
                return Ok(SubjectState::Failed);
            }
        };

        match payload::relationship_ids(&payload) {
            Linkage::Found(ids) => {
                let mut links = Vec::with_capacity(ids.len());
                for id in ids {
                    links.push(store.append_relationship_link(cpf, &id)?);
                }
                log::info!("Resolved {cpf}: {} relationship(s)", links.len());
                Ok(SubjectState::Resolved(links))
            }
            Linkage::NotFound => {
                log::info!("No linkage for {cpf}");
                store.append_failure_report(cpf, None, NO_LINKAGE_MESSAGE)?;
                Ok(SubjectState::NoLinkage)
            }
            Linkage::Malformed(raw) => {
                log::warn!("Malformed stage 1 payload for {cpf}");
                store.append_failure_report(cpf, None, &raw)?;
                Ok(SubjectState::Failed)
            }
        }
    }

    // ── Stage 2 ────────────────────────────────────────────────

    pub fn fetch_limits(
        &self,
        store: &EnrichStore,
        link: &RelationshipLink,
        phone: Option<&str>,
        cancel: &CancelToken,
    ) -> EnrichResult<LimitState> {
        let cpf = link.subject_id.as_str();
        let rel = link.relationship_id.as_str();
        let retried = self.authorized_call(&self.limit_url(cpf, rel), cancel)?;

        let payload = match retried.outcome {
            Outcome::Payload(json) => json,
            ref other => {
                log::warn!("Stage 2 failed for {cpf}/{rel}: {}", other.describe());
                store.append_failure_report(cpf, Some(rel), &other.describe())?;
                return Ok(LimitState::Failed);
            }
        };

        match payload::limit_details(&payload, link, phone) {
            LimitRows::Rows(rows) => {
                for row in &rows {
                    store.append_limit_detail(row)?;
                }
                log::info!("Stored {} limit row(s) for {cpf}/{rel}", rows.len());
                Ok(LimitState::Resolved { rows: rows.len() })
            }
            LimitRows::Empty => {
                log::info!("No limit details for {cpf}/{rel}");
                store.append_failure_report(cpf, Some(rel), NO_LIMITS_MESSAGE)?;
                Ok(LimitState::Failed)
            }
            LimitRows::Malformed(raw) => {
                log::warn!("Malformed stage 2 payload for {cpf}/{rel}");
                store.append_failure_report(cpf, Some(rel), &raw)?;
                Ok(LimitState::Failed)
            }
        }
    }

    /// Stage 1, then stage 2 for every link it produced.
    pub fn enrich_subject(
        &self,
        store: &EnrichStore,
        subject: &Subject,
        cancel: &CancelToken,
    ) -> EnrichResult<BatchTally> {
        let mut tally = BatchTally::default();
        match self.resolve_subject(store, subject, cancel)? {
            SubjectState::Resolved(links) => {
                tally.resolved += 1;
                for link in &links {
                    self.tally_limits(store, link, subject.phone.as_deref(), cancel, &mut tally)?;
                }
            }
            SubjectState::NoLinkage => tally.no_linkage += 1,
            SubjectState::Failed => tally.failed += 1,
        }
        Ok(tally)
    }

    pub fn tally_limits(
        &self,
        store: &EnrichStore,
        link: &RelationshipLink,
        phone: Option<&str>,
        cancel: &CancelToken,
        tally: &mut BatchTally,
    ) -> EnrichResult<()> {
        match self.fetch_limits(store, link, phone, cancel)? {
            LimitState::Resolved { rows } => tally.limit_rows += rows,
            LimitState::Failed => tally.limit_failed += 1,
        }
        Ok(())
    }

    /// One gateway call wrapped in the unauthorized-recovery loop.
    /// Transport faults fold into `Outcome::Failure` with no status; a
    /// missing token counts as unauthorized so recovery fetches one.
    fn authorized_call(&self, url: &str, cancel: &CancelToken) -> EnrichResult<Retried> {
        let seen = Cell::new(self.tokens.generation());
        with_auth_retry(
            self.max_auth_retries,
            || self.tokens.recover(seen.get(), cancel),
            || {
                seen.set(self.tokens.generation());
                let headers = match self.tokens.current_headers() {
                    Ok(h) => h,
                    Err(EnrichError::NoTokenAvailable) => {
                        return Ok(Outcome::Unauthorized {
                            body: "no auth token available".into(),
                        })
                    }
                    Err(e) => return Err(e),
                };
                match self.gateway.call(url, &headers, cancel) {
                    Err(EnrichError::Transport { reason, .. }) => {
                        Ok(Outcome::Failure { status: None, body: reason })
                    }
                    other => other,
                }
            },
        )
    }
}
