//! Unauthorized recovery: invalidate, refresh, retry; at most two
//! refreshes per call before the subject is reported as failed.

mod common;

use common::{harness, harness_seeded, harness_with, stage1, stage2, ScriptedTransport};
use consig_core::{config::EnrichConfig, error::EnrichResult, transport::RawResponse};
use serde_json::json;
use std::sync::{Arc, Barrier};

const CPF: &str = "12345678900";

/// 401 for the first `n` calls, then `then` as a 200.
fn unauthorized_for_first(
    n: usize,
    then: serde_json::Value,
) -> impl Fn(usize) -> EnrichResult<RawResponse> + Send + Sync + 'static {
    let body = then.to_string();
    move |nth| {
        if nth < n {
            Ok(RawResponse::new(401, "token expired"))
        } else {
            Ok(RawResponse::new(200, body.clone()))
        }
    }
}

#[test]
fn recovers_after_one_or_two_unauthorized_responses() {
    for rejections in 1..=2 {
        let transport = ScriptedTransport::new()
            .on_get(&stage1(CPF), unauthorized_for_first(rejections, json!([{ "idConvenio": "184" }])))
            .on_get_json(&stage2(CPF, "184"), json!([{ "nome": "Maria" }]));
        let h = harness_seeded(transport, "stale");

        h.engine.enrich([CPF]).expect("enrich");
        let store = h.engine.store();

        assert_eq!(store.relationship_links_for(CPF).expect("links").len(), 1);
        assert!(store.failure_reports_for(CPF).expect("failures").is_empty());
        assert_eq!(h.transport.get_count(&stage1(CPF)), rejections + 1);
        assert_eq!(h.transport.auth_count(), rejections, "one refresh per rejection");
    }
}

#[test]
fn gives_up_after_two_refreshes() {
    let transport = ScriptedTransport::new()
        .on_get(&stage1(CPF), |_| Ok(RawResponse::new(401, "token expired")));
    let h = harness_seeded(transport, "stale");

    h.engine.enrich([CPF]).expect("enrich");
    let store = h.engine.store();

    assert_eq!(h.transport.auth_count(), 2);
    assert_eq!(h.engine.tokens().refresh_count(), 2);
    assert_eq!(h.transport.get_count(&stage1(CPF)), 3);

    let failures = store.failure_reports_for(CPF).expect("failures");
    assert_eq!(failures.len(), 1);
    let described: serde_json::Value = serde_json::from_str(&failures[0].message).expect("json");
    assert_eq!(described["status"], json!(401));
    assert_eq!(store.relationship_link_count().expect("count"), 0);
}

#[test]
fn stage_two_shares_the_recovery_path() {
    let transport = ScriptedTransport::new()
        .on_get_json(&stage1(CPF), json!([{ "idConvenio": "184" }]))
        .on_get(&stage2(CPF, "184"), unauthorized_for_first(1, json!([{ "nome": "Maria" }])));
    let h = harness_seeded(transport, "stale");

    h.engine.enrich([CPF]).expect("enrich");

    assert_eq!(h.engine.store().limit_details_for(CPF).expect("limits").len(), 1);
    assert_eq!(h.transport.auth_count(), 1);
}

#[test]
fn retried_calls_carry_the_fresh_token() {
    let transport = ScriptedTransport::new()
        .on_get(&stage1(CPF), unauthorized_for_first(1, json!([])));
    let h = harness_seeded(transport, "stale");

    h.engine.enrich([CPF]).expect("enrich");

    let auth: Vec<String> = h
        .transport
        .gets()
        .into_iter()
        .filter_map(|(_, headers)| {
            headers
                .into_iter()
                .find(|(k, _)| k == "Authorization")
                .map(|(_, v)| v)
        })
        .collect();
    assert_eq!(auth, vec!["Bearer stale".to_string(), "Bearer token-1".to_string()]);
}

#[test]
fn unauthorized_purges_the_persisted_token() {
    let transport = ScriptedTransport::new()
        .on_get(&stage1(CPF), |_| Ok(RawResponse::new(401, "token expired")))
        .on_auth(|_| RawResponse::new(503, "auth down"));
    let h = harness_seeded(transport, "stale");

    h.engine.enrich([CPF]).expect("enrich");
    let store = h.engine.store();

    // Each recovery empties the log before fetching, so only the last
    // failed fetch remains.
    assert_eq!(store.latest_auth_token_record().expect("latest"), None);
    assert_eq!(store.auth_token_record_count().expect("count"), 1);
    assert_eq!(h.transport.get_count(&stage1(CPF)), 1);
    assert_eq!(store.failure_reports_for(CPF).expect("failures").len(), 1);
}

#[test]
fn missing_token_is_recovered_like_a_rejection() {
    // The first two fetches fail, so the initial fetch and the first
    // recovery leave no token; the second recovery succeeds.
    let transport = ScriptedTransport::new()
        .on_get_json(&stage1(CPF), json!([]))
        .on_auth(|nth| {
            if nth < 2 {
                RawResponse::new(500, "unavailable")
            } else {
                RawResponse::new(200, r#"{"accessToken":"late"}"#)
            }
        });
    let h = harness(transport);

    h.engine.enrich([CPF]).expect("enrich");

    assert_eq!(h.transport.auth_count(), 3);
    assert_eq!(h.transport.get_count(&stage1(CPF)), 1);
    let failures = h.engine.store().failure_reports_for(CPF).expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].message, "idConvenio not found");
}

#[test]
fn no_token_at_all_fails_without_calling_the_partner() {
    let transport = ScriptedTransport::new().on_auth(|_| RawResponse::new(500, "unavailable"));
    let h = harness(transport);

    h.engine.enrich([CPF]).expect("enrich");

    assert_eq!(h.transport.total_gets(), 0);
    // Initial fetch plus two recoveries.
    assert_eq!(h.transport.auth_count(), 3);
    assert_eq!(h.engine.store().failure_reports_for(CPF).expect("failures").len(), 1);
}

#[test]
fn simultaneous_rejections_trigger_a_single_refresh() {
    let ids: Vec<String> = (1..=4).map(|i| format!("{i:011}")).collect();
    // Every worker's first call waits here, so all four hold the stale
    // token when the partner rejects it.
    let rejected = Arc::new(Barrier::new(ids.len()));
    let mut transport = ScriptedTransport::new();
    for id in &ids {
        let rejected = rejected.clone();
        transport = transport.on_get(&stage1(id), move |nth| {
            if nth == 0 {
                rejected.wait();
                Ok(RawResponse::new(401, "token expired"))
            } else {
                Ok(RawResponse::new(200, "[]"))
            }
        });
    }
    let mut config = EnrichConfig::default_test();
    config.batch_size = 1;
    config.max_workers = ids.len();
    let h = harness_with(transport, config, Some("stale"));

    h.engine.enrich(ids.iter().map(String::as_str)).expect("enrich");

    assert_eq!(h.transport.auth_count(), 1);
    assert_eq!(h.engine.tokens().refresh_count(), 1);
    for id in &ids {
        assert_eq!(h.transport.get_count(&stage1(id)), 2);
        let failures = h.engine.store().failure_reports_for(id).expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "idConvenio not found");
    }
}
