//! Single authenticated partner call, rate-limited and classified.
//!
//! RULE: `call()` never fails on an HTTP status. Only transport faults
//! and cancellation come back as `Err`.

use crate::{
    cancel::CancelToken,
    error::EnrichResult,
    rate_governor::RateGovernor,
    transport::{Headers, PartnerTransport, RawResponse},
};
use serde_json::Value;
use std::sync::Arc;

pub const STATUS_UNAUTHORIZED: u16 = 401;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 2xx with a JSON body.
    Payload(Value),
    /// 401; the body is kept for the exhaustion report.
    Unauthorized { body: String },
    /// Any other status, or a 2xx body that is not JSON. `status` is
    /// `None` for transport faults the caller folded in.
    Failure { status: Option<u16>, body: String },
}

impl Outcome {
    pub fn classify(raw: RawResponse) -> Self {
        if raw.status == STATUS_UNAUTHORIZED {
            return Outcome::Unauthorized { body: raw.body };
        }
        if !raw.is_success() {
            return Outcome::Failure { status: Some(raw.status), body: raw.body };
        }
        match serde_json::from_str::<Value>(&raw.body) {
            Ok(json) => Outcome::Payload(json),
            Err(_) => Outcome::Failure { status: Some(raw.status), body: raw.body },
        }
    }

    /// The raw response as a JSON string, used as a failure message.
    pub fn describe(&self) -> String {
        let (status, body) = match self {
            Outcome::Payload(v) => (Some(200), v.to_string()),
            Outcome::Unauthorized { body } => (Some(STATUS_UNAUTHORIZED), body.clone()),
            Outcome::Failure { status, body } => (*status, body.clone()),
        };
        serde_json::json!({ "status": status, "body": body }).to_string()
    }
}

pub struct ApiGateway {
    transport: Arc<dyn PartnerTransport>,
    governor:  Arc<RateGovernor>,
}

impl ApiGateway {
    pub fn new(transport: Arc<dyn PartnerTransport>, governor: Arc<RateGovernor>) -> Self {
        Self { transport, governor }
    }

    pub fn call(&self, url: &str, headers: &Headers, cancel: &CancelToken) -> EnrichResult<Outcome> {
        self.governor.admit(cancel)?;
        cancel.check()?;
        let raw = self.transport.get(url, headers)?;
        log::debug!("GET {url} -> {}", raw.status);
        Ok(Outcome::classify(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_distinguishes_401() {
        assert_eq!(
            Outcome::classify(RawResponse::new(401, "expired")),
            Outcome::Unauthorized { body: "expired".into() }
        );
        assert_eq!(
            Outcome::classify(RawResponse::new(403, "forbidden")),
            Outcome::Failure { status: Some(403), body: "forbidden".into() }
        );
        assert_eq!(
            Outcome::classify(RawResponse::new(500, "")),
            Outcome::Failure { status: Some(500), body: String::new() }
        );
    }

    #[test]
    fn classify_parses_json_payloads() {
        let out = Outcome::classify(RawResponse::new(200, r#"[{"idConvenio":"184"}]"#));
        assert_eq!(out, Outcome::Payload(serde_json::json!([{ "idConvenio": "184" }])));
    }

    #[test]
    fn non_json_success_is_a_failure() {
        let out = Outcome::classify(RawResponse::new(200, "<html>maintenance</html>"));
        assert!(matches!(out, Outcome::Failure { status: Some(200), .. }));
    }

    #[test]
    fn describe_serializes_status_and_body() {
        let msg = Outcome::Unauthorized { body: "nope".into() }.describe();
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["status"], 401);
        assert_eq!(v["body"], "nope");
    }
}
