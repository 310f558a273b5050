//! Shared fixtures: a scripted partner transport and engine builders.

#![allow(dead_code)]

use chrono::NaiveDate;
use consig_core::{
    clock::ManualClock,
    config::EnrichConfig,
    engine::EnrichmentEngine,
    error::EnrichResult,
    store::EnrichStore,
    transport::{Headers, PartnerTransport, RawResponse},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

type GetResponder = Box<dyn Fn(usize) -> EnrichResult<RawResponse> + Send + Sync>;
type AuthResponder = Box<dyn Fn(usize) -> RawResponse + Send + Sync>;

/// Answers GETs by the first route whose fragment the URL contains.
/// Each responder gets the number of earlier calls to that same URL.
pub struct ScriptedTransport {
    routes: Vec<(String, GetResponder)>,
    auth:   AuthResponder,
    gets:   Mutex<Vec<(String, Headers)>>,
    posts:  Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    /// Auth always succeeds with `token-<n>`; unmatched GETs are 404.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            auth: Box::new(|n| {
                RawResponse::new(200, format!(r#"{{"accessToken":"token-{}"}}"#, n + 1))
            }),
            gets: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn on_get(
        mut self,
        fragment: &str,
        respond: impl Fn(usize) -> EnrichResult<RawResponse> + Send + Sync + 'static,
    ) -> Self {
        self.routes.push((fragment.to_string(), Box::new(respond)));
        self
    }

    /// Fixed JSON answer for every call to `fragment`.
    pub fn on_get_json(self, fragment: &str, body: Value) -> Self {
        let body = body.to_string();
        self.on_get(fragment, move |_| Ok(RawResponse::new(200, body.clone())))
    }

    pub fn on_auth(mut self, respond: impl Fn(usize) -> RawResponse + Send + Sync + 'static) -> Self {
        self.auth = Box::new(respond);
        self
    }

    pub fn get_count(&self, fragment: &str) -> usize {
        self.gets.lock().iter().filter(|(u, _)| u.contains(fragment)).count()
    }

    pub fn total_gets(&self) -> usize {
        self.gets.lock().len()
    }

    pub fn auth_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn gets(&self) -> Vec<(String, Headers)> {
        self.gets.lock().clone()
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().clone()
    }
}

impl PartnerTransport for ScriptedTransport {
    fn get(&self, url: &str, headers: &Headers) -> EnrichResult<RawResponse> {
        let nth = {
            let mut gets = self.gets.lock();
            let nth = gets.iter().filter(|(u, _)| u == url).count();
            gets.push((url.to_string(), headers.clone()));
            nth
        };
        match self.routes.iter().find(|(frag, _)| url.contains(frag.as_str())) {
            Some((_, respond)) => respond(nth),
            None => Ok(RawResponse::new(404, "not found")),
        }
    }

    fn post_json(&self, url: &str, body: &Value) -> EnrichResult<RawResponse> {
        let nth = {
            let mut posts = self.posts.lock();
            posts.push((url.to_string(), body.clone()));
            posts.len() - 1
        };
        Ok((self.auth)(nth))
    }
}

pub fn stage1(cpf: &str) -> String {
    format!("consulta-cpf?cpfRequest={cpf}")
}

pub fn stage2(cpf: &str, rel: &str) -> String {
    format!("limite/consultar/{cpf}/{rel}")
}

/// Route engine logs through the test harness; `RUST_LOG` applies.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A file-backed store in a fresh temp dir. Keep the dir alive.
pub fn temp_store() -> (EnrichStore, TempDir) {
    init_logging();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("enrich.db");
    let store = EnrichStore::open(path.to_str().expect("utf-8 path")).expect("open store");
    store.migrate().expect("migrate");
    (store, dir)
}

/// Mid-morning, so the peak ceiling applies; sleeping is instant.
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .expect("date")
            .and_hms_opt(10, 0, 0)
            .expect("time"),
    ))
}

pub struct Harness {
    pub engine:    EnrichmentEngine,
    pub transport: Arc<ScriptedTransport>,
    pub clock:     Arc<ManualClock>,
    _dir:          TempDir,
}

pub fn harness(transport: ScriptedTransport) -> Harness {
    harness_with(transport, EnrichConfig::default_test(), None)
}

/// Engine whose token log already holds `seed_token`, so no initial
/// refresh happens.
pub fn harness_seeded(transport: ScriptedTransport, seed_token: &str) -> Harness {
    harness_with(transport, EnrichConfig::default_test(), Some(seed_token))
}

pub fn harness_with(
    transport: ScriptedTransport,
    config: EnrichConfig,
    seed_token: Option<&str>,
) -> Harness {
    let (store, dir) = temp_store();
    if let Some(token) = seed_token {
        store
            .append_auth_token_record(Some(token), None)
            .expect("seed token");
    }
    let transport = Arc::new(transport);
    let clock = manual_clock();
    let engine = EnrichmentEngine::with_parts(&config, store, transport.clone(), clock.clone())
        .expect("build engine");
    Harness { engine, transport, clock, _dir: dir }
}
