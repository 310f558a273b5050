//! Shared record types used across the enrichment engine.

use crate::error::{EnrichError, EnrichResult};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The canonical enrichment run identifier.
pub type RunId = String;

/// Partner-assigned relationship identifier ("idConvenio").
pub type RelationshipId = String;

/// Length of a normalized subject identifier.
pub const SUBJECT_ID_LEN: usize = 11;

/// A normalized 11-digit tax ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Strip every non-digit character and require exactly 11 digits.
    pub fn normalize(raw: &str) -> EnrichResult<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != SUBJECT_ID_LEN {
            return Err(EnrichError::InvalidSubject { raw: raw.to_string() });
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One input row handed to the engine by the data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectInput {
    pub raw_id: String,
    pub phone:  Option<String>,
}

impl SubjectInput {
    pub fn new(raw_id: impl Into<String>) -> Self {
        Self { raw_id: raw_id.into(), phone: None }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = normalize_phone(&phone.into());
        self
    }
}

impl From<&str> for SubjectInput {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Digits only; anything shorter than 8 digits is dropped.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() >= 8).then_some(digits)
}

/// A subject that passed normalization and is queued for stage 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id:    SubjectId,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipLink {
    pub id:              Option<i64>,
    pub subject_id:      String,
    pub relationship_id: RelationshipId,
    pub resolved_at:     NaiveDateTime,
}

/// One row per partner "option"; base fields are shared across the
/// rows fanned out from the same lookup entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LimitDetail {
    pub subject_id:                Option<String>,
    pub relationship_id:           Option<String>,
    pub name:                      Option<String>,
    pub phone:                     Option<String>,
    pub registration:              Option<String>,
    pub withdrawal_multiple:       Option<f64>,
    pub limit_used:                Option<f64>,
    pub limit_total:               Option<f64>,
    pub limit_available:           Option<f64>,
    pub installment_limit:         Option<f64>,
    pub installment_limit_used:    Option<f64>,
    pub installment_limit_available: Option<f64>,
    pub margin:                    Option<f64>,
    pub purchase_multiple:         Option<f64>,
    pub purchase_limit:            Option<f64>,
    pub bank_code:                 Option<String>,
    pub branch_code:               Option<String>,
    pub account_code:              Option<String>,
    pub do_not_disturb:            Option<bool>,
    pub supplementary_withdrawal:  Option<bool>,
    pub refinancing:               Option<Value>,
    pub refinancing_contracts:     Option<String>,
    pub refinancing_max_installment: Option<f64>,
    pub refinancing_contract_value: Option<f64>,
    /// Fields of the option this row was fanned out from.
    pub option:                    Map<String, Value>,
}

impl LimitDetail {
    /// Base fields under their partner names, with the option's fields
    /// merged on top.
    pub fn merged(&self) -> Map<String, Value> {
        let mut out = Map::new();
        let mut put = |k: &str, v: Value| {
            out.insert(k.to_string(), v);
        };
        put("cpf", opt_json(&self.subject_id));
        put("idConvenio", opt_json(&self.relationship_id));
        put("nome", opt_json(&self.name));
        put("phone", opt_json(&self.phone));
        put("matricula", opt_json(&self.registration));
        put("vlMultiploSaque", opt_json(&self.withdrawal_multiple));
        put("limiteUtilizado", opt_json(&self.limit_used));
        put("limiteTotal", opt_json(&self.limit_total));
        put("limiteDisponivel", opt_json(&self.limit_available));
        put("vlLimiteParcela", opt_json(&self.installment_limit));
        put("limiteParcelaUtilizado", opt_json(&self.installment_limit_used));
        put("limiteParcelaDisponivel", opt_json(&self.installment_limit_available));
        put("vlMargem", opt_json(&self.margin));
        put("vlMultiploCompra", opt_json(&self.purchase_multiple));
        put("vlLimiteCompra", opt_json(&self.purchase_limit));
        put("cdBanco", opt_json(&self.bank_code));
        put("cdAgencia", opt_json(&self.branch_code));
        put("cdConta", opt_json(&self.account_code));
        put("naoPerturbe", opt_json(&self.do_not_disturb));
        put("saqueComplementar", opt_json(&self.supplementary_withdrawal));
        put("refinanciamento", self.refinancing.clone().unwrap_or(Value::Null));
        put("numeroContratos", opt_json(&self.refinancing_contracts));
        put("vlMaximoParcela", opt_json(&self.refinancing_max_installment));
        put("vlContrato", opt_json(&self.refinancing_contract_value));
        for (k, v) in &self.option {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}

fn opt_json<T: Serialize>(v: &Option<T>) -> Value {
    v.as_ref()
        .and_then(|x| serde_json::to_value(x).ok())
        .unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub id:              Option<i64>,
    pub subject_id:      String,
    pub relationship_id: Option<RelationshipId>,
    pub message:         String,
    pub created_at:      NaiveDateTime,
}

/// A token fetch attempt. Failed fetches carry only `exception`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthTokenRecord {
    pub id:         Option<i64>,
    pub token:      Option<String>,
    pub exception:  Option<String>,
    pub created_at: NaiveDateTime,
}
