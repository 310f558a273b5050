//! Bearer token ownership.
//!
//! RULE: `refresh()` is the only writer of the in-memory token and
//! `current_headers()` its only reader. Every refresh attempt is logged to
//! the token table, which doubles as the cross-process token cache.
//!
//! Recovery after a 401 is single-flight: `recover()` serializes on a
//! lock and skips the refresh when another worker already replaced the
//! token the failing call used.

use crate::{
    cancel::CancelToken,
    error::{EnrichError, EnrichResult},
    store::{EnrichStore, PurgeTarget},
    transport::{Headers, PartnerTransport},
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    #[serde(rename = "usuario")]
    pub username: String,
    #[serde(rename = "senha")]
    pub password: String,
}

pub struct TokenManager {
    transport:   Arc<dyn PartnerTransport>,
    auth_url:    String,
    credentials: Credentials,
    user_agent:  String,
    current:     RwLock<Option<String>>,
    /// Dedicated connection; the mutex orders latest-token reads
    /// against token appends.
    store:       Mutex<EnrichStore>,
    refreshes:   AtomicU32,
    /// Bumped by every successful refresh.
    generation:  AtomicU64,
    recovering:  Mutex<()>,
}

impl TokenManager {
    pub fn new(
        transport: Arc<dyn PartnerTransport>,
        auth_url: impl Into<String>,
        credentials: Credentials,
        user_agent: impl Into<String>,
        store: EnrichStore,
    ) -> Self {
        Self {
            transport,
            auth_url: auth_url.into(),
            credentials,
            user_agent: user_agent.into(),
            current: RwLock::new(None),
            store: Mutex::new(store),
            refreshes: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            recovering: Mutex::new(()),
        }
    }

    /// Authorization and User-Agent headers for a partner call.
    /// Falls back to the newest persisted token on a cold start.
    pub fn current_headers(&self) -> EnrichResult<Headers> {
        if let Some(token) = self.current.read().clone() {
            return Ok(self.headers_for(&token));
        }

        let record = self.store.lock().latest_auth_token_record()?;
        let token = record
            .and_then(|r| r.token)
            .ok_or(EnrichError::NoTokenAvailable)?;
        log::debug!("Adopted persisted auth token");
        let mut current = self.current.write();
        let token = current.get_or_insert(token).clone();
        Ok(self.headers_for(&token))
    }

    /// Fetch a fresh token. Returns whether a token was obtained; a
    /// failed fetch is logged and leaves the current token in place.
    pub fn refresh(&self, cancel: &CancelToken) -> EnrichResult<bool> {
        cancel.check()?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_value(&self.credentials)?;

        let failure = match self.transport.post_json(&self.auth_url, &body) {
            Ok(raw) if raw.status == 200 => match extract_access_token(&raw.body) {
                Some(token) => {
                    // Hold the store lock so a concurrent cold start sees
                    // either the old row or this one.
                    let store = self.store.lock();
                    store.append_auth_token_record(Some(&token), None)?;
                    *self.current.write() = Some(token);
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    log::info!("Auth token refreshed");
                    return Ok(true);
                }
                None => format!("Token response missing accessToken: {}", raw.body),
            },
            Ok(raw) => format!(
                "Error obtaining token. Status code: {} body: {}",
                raw.status, raw.body
            ),
            Err(e) => format!("Error obtaining token: {e}"),
        };

        log::warn!("{failure}");
        self.store.lock().append_auth_token_record(None, Some(&failure))?;
        Ok(false)
    }

    /// Discard the current token after a 401: clear it in memory and
    /// purge the token log so a cold start cannot re-adopt it.
    pub fn invalidate(&self) -> EnrichResult<()> {
        let store = self.store.lock();
        *self.current.write() = None;
        store.purge(PurgeTarget::TokenLog)?;
        Ok(())
    }

    /// Token generation; read it before `current_headers()` and hand it
    /// to `recover()` if the call is rejected.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate and refresh after a rejection, unless a refresh has
    /// already succeeded since `seen` was read. Concurrent callers queue
    /// on one lock, so a burst of 401s costs a single token fetch.
    pub fn recover(&self, seen: u64, cancel: &CancelToken) -> EnrichResult<()> {
        let _guard = self.recovering.lock();
        if self.generation() != seen {
            log::debug!("Auth token already refreshed by another worker");
            return Ok(());
        }
        self.invalidate()?;
        self.refresh(cancel)?;
        Ok(())
    }

    /// Refresh attempts made by this manager so far.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn headers_for(&self, token: &str) -> Headers {
        vec![
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("User-Agent".to_string(), self.user_agent.clone()),
        ]
    }
}

fn extract_access_token(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("accessToken")?.as_str().map(str::to_string)
}
