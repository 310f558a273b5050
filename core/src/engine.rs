//! The enrichment engine: entry point for callers.
//!
//! EXECUTION ORDER (per run):
//!   1. Normalize and de-duplicate input ids; invalid ids are logged and skipped.
//!   2. Record the run and queue every valid subject.
//!   3. Make sure a token exists (persisted or freshly fetched).
//!   4. Hand subjects to the batch scheduler; each worker runs stage 1
//!      then stage 2 for its subjects on its own store connection.
//!   5. Mark the run finished.
//!
//! RULES:
//!   - Results are observed through the store and the log only; `enrich`
//!     returns the run id, never a verdict.
//!   - The engine needs a file-backed store: workers reopen it.
//!   - A cancellation ends the run that observes it. The token is then
//!     re-armed, so `resume` on the same engine continues the work.

use crate::{
    cancel::CancelToken,
    clock::{Clock, SystemClock},
    config::EnrichConfig,
    enricher::{BatchTally, Enricher},
    error::{EnrichError, EnrichResult},
    gateway::ApiGateway,
    rate_governor::RateGovernor,
    scheduler::{BatchReport, BatchScheduler},
    store::EnrichStore,
    token::{Credentials, TokenManager},
    transport::{HttpTransport, PartnerTransport},
    types::{RelationshipLink, RunId, Subject, SubjectId, SubjectInput},
};
use std::collections::HashSet;
use std::sync::Arc;

pub struct EnrichmentEngine {
    store:     EnrichStore,
    /// Database path each worker opens its own connection to.
    db_path:   String,
    enricher:  Enricher,
    tokens:    Arc<TokenManager>,
    governor:  Arc<RateGovernor>,
    scheduler: BatchScheduler,
    cancel:    CancelToken,
}

impl EnrichmentEngine {
    /// Build a fully wired engine talking to the real partner API.
    pub fn build(config: &EnrichConfig, store: EnrichStore) -> EnrichResult<Self> {
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        Self::with_parts(config, store, transport, Arc::new(SystemClock))
    }

    /// Build with an explicit transport and clock.
    pub fn with_parts(
        config: &EnrichConfig,
        store: EnrichStore,
        transport: Arc<dyn PartnerTransport>,
        clock: Arc<dyn Clock>,
    ) -> EnrichResult<Self> {
        let db_path = store
            .path()
            .ok_or_else(|| {
                EnrichError::Config(
                    "enrichment needs a file-backed store; workers open their own connections".into(),
                )
            })?
            .to_string();
        store.migrate()?;

        let governor = Arc::new(RateGovernor::new(config.rate_limit.policy(), clock));
        let tokens = Arc::new(TokenManager::new(
            transport.clone(),
            config.auth_url.clone(),
            Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            config.user_agent.clone(),
            store.reopen()?,
        ));
        let gateway = Arc::new(ApiGateway::new(transport, governor.clone()));
        let enricher = Enricher::new(gateway, tokens.clone(), &config.base_url, config.max_auth_retries);

        Ok(Self {
            store,
            db_path,
            enricher,
            tokens,
            governor,
            scheduler: BatchScheduler::new(config.batch_size, config.max_workers),
            cancel: CancelToken::new(),
        })
    }

    /// Handle a caller can use to abort a running batch from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &EnrichStore {
        &self.store
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// Enrich a list of raw subject identifiers through both stages.
    pub fn enrich<I>(&self, inputs: impl IntoIterator<Item = I>) -> EnrichResult<RunId>
    where
        I: Into<SubjectInput>,
    {
        let subjects = normalize_inputs(inputs);
        self.consume_cancel(|| {
            let run_id = self.start_run(subjects.len())?;
            for subject in &subjects {
                self.store.enqueue_subject(subject)?;
            }
            self.run_subjects(&subjects)?;
            self.finish_run(&run_id)?;
            Ok(run_id)
        })
    }

    /// Continue interrupted work: pending subjects through both stages,
    /// then any link still waiting for stage 2.
    pub fn resume(&self) -> EnrichResult<RunId> {
        self.consume_cancel(|| {
            let subjects = self.store.list_pending_subjects()?;
            let run_id = self.start_run(subjects.len())?;
            log::info!("Resuming {} pending subject(s)", subjects.len());
            self.run_subjects(&subjects)?;
            self.run_links(&self.store.list_resolved_relationships()?)?;
            self.finish_run(&run_id)?;
            Ok(run_id)
        })
    }

    /// Stage 2 only, for resolved links that have no limit rows yet.
    pub fn fetch_pending_limits(&self) -> EnrichResult<RunId> {
        self.consume_cancel(|| {
            let links = self.store.list_resolved_relationships()?;
            let run_id = self.start_run(links.len())?;
            self.run_links(&links)?;
            self.finish_run(&run_id)?;
            Ok(run_id)
        })
    }

    /// Run `body`; if it ended in `Cancelled`, re-arm the token for the
    /// next call.
    fn consume_cancel<T>(&self, body: impl FnOnce() -> EnrichResult<T>) -> EnrichResult<T> {
        let result = body();
        if matches!(result, Err(EnrichError::Cancelled)) {
            log::info!("Run cancelled; pending work is left for resume");
            self.cancel.reset();
        }
        result
    }

    fn start_run(&self, subject_count: usize) -> EnrichResult<RunId> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert_run(&run_id, subject_count, env!("CARGO_PKG_VERSION"))?;
        log::info!("Run {run_id} started with {subject_count} item(s)");
        Ok(run_id)
    }

    fn finish_run(&self, run_id: &str) -> EnrichResult<()> {
        self.store.finish_run(run_id)?;
        log::info!("Run {run_id} finished");
        Ok(())
    }

    /// Adopt a persisted token or fetch one. A failed fetch is not fatal:
    /// the per-call recovery path will try again.
    fn ensure_token(&self) -> EnrichResult<()> {
        match self.tokens.current_headers() {
            Ok(_) => Ok(()),
            Err(EnrichError::NoTokenAvailable) => {
                if !self.tokens.refresh(&self.cancel)? {
                    log::warn!("Starting without an auth token");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn run_subjects(&self, subjects: &[Subject]) -> EnrichResult<()> {
        if subjects.is_empty() {
            return Ok(());
        }
        self.ensure_token()?;
        let (enricher, cancel, db_path) = (&self.enricher, &self.cancel, self.db_path.as_str());
        let reports = self.scheduler.run(
            subjects,
            cancel,
            || EnrichStore::open(db_path),
            |store, batch| {
                let mut tally = BatchTally::default();
                for subject in batch {
                    tally.absorb(enricher.enrich_subject(store, subject, cancel)?);
                }
                Ok(tally)
            },
        );
        self.check_cancelled(&reports)
    }

    fn run_links(&self, links: &[RelationshipLink]) -> EnrichResult<()> {
        if links.is_empty() {
            return Ok(());
        }
        self.ensure_token()?;
        let (enricher, cancel, db_path) = (&self.enricher, &self.cancel, self.db_path.as_str());
        let reports = self.scheduler.run(
            links,
            cancel,
            || EnrichStore::open(db_path),
            |store, batch| {
                let mut tally = BatchTally::default();
                for link in batch {
                    let phone = store.subject_phone(&link.subject_id)?;
                    enricher.tally_limits(store, link, phone.as_deref(), cancel, &mut tally)?;
                }
                Ok(tally)
            },
        );
        self.check_cancelled(&reports)
    }

    fn check_cancelled(&self, reports: &[BatchReport]) -> EnrichResult<()> {
        let failed = reports.iter().filter(|r| r.result.is_err()).count();
        if failed > 0 {
            log::warn!("{failed} of {} batch(es) did not complete", reports.len());
        }
        if self.cancel.is_cancelled() {
            return Err(EnrichError::Cancelled);
        }
        Ok(())
    }
}

/// Normalize ids, keep the first occurrence of each, and log the rest.
pub fn normalize_inputs<I>(inputs: impl IntoIterator<Item = I>) -> Vec<Subject>
where
    I: Into<SubjectInput>,
{
    let mut seen = HashSet::new();
    let mut subjects = Vec::new();
    for (index, input) in inputs.into_iter().map(Into::into).enumerate() {
        match SubjectId::normalize(&input.raw_id) {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    subjects.push(Subject { id, phone: input.phone });
                } else {
                    log::debug!("Duplicate subject at index {index}: {id}");
                }
            }
            Err(_) => log::warn!("Invalid CPF at index {index}: {}", input.raw_id),
        }
    }
    subjects
}
