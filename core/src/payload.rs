//! Shaping partner payloads into store records.
//!
//! Stage 1 yields relationship ids; stage 2 yields one `LimitDetail` per
//! option, with the entry's base fields copied onto each. Limit rows are
//! always keyed by the link they were fetched for, never by the ids the
//! partner echoes back.

use crate::types::{LimitDetail, RelationshipLink};
use serde_json::{Map, Value};

/// What a stage-1 payload resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    Found(Vec<String>),
    NotFound,
    /// Not a JSON list; carries the raw payload.
    Malformed(String),
}

pub fn relationship_ids(payload: &Value) -> Linkage {
    let Some(entries) = payload.as_array() else {
        return Linkage::Malformed(payload.to_string());
    };
    let ids: Vec<String> = entries
        .iter()
        .filter_map(|e| e.get("idConvenio"))
        .filter_map(scalar_string)
        .collect();
    if ids.is_empty() {
        Linkage::NotFound
    } else {
        Linkage::Found(ids)
    }
}

/// What a stage-2 payload resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitRows {
    Rows(Vec<LimitDetail>),
    Empty,
    Malformed(String),
}

pub fn limit_details(payload: &Value, link: &RelationshipLink, phone: Option<&str>) -> LimitRows {
    let Some(entries) = payload.as_array() else {
        return LimitRows::Malformed(payload.to_string());
    };

    let mut rows = Vec::new();
    for entry in entries {
        let Some(obj) = entry.as_object() else {
            return LimitRows::Malformed(payload.to_string());
        };
        let mut base = base_fields(obj);
        base.subject_id = Some(link.subject_id.clone());
        base.relationship_id = Some(link.relationship_id.clone());
        base.phone = phone.map(str::to_string);

        let options: Vec<&Map<String, Value>> = obj
            .get("opcoes")
            .and_then(Value::as_array)
            .map(|opts| opts.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default();

        if options.is_empty() {
            rows.push(base);
            continue;
        }
        for option in options {
            let mut row = base.clone();
            row.option = option.clone();
            rows.push(row);
        }
    }

    if rows.is_empty() {
        LimitRows::Empty
    } else {
        LimitRows::Rows(rows)
    }
}

fn base_fields(obj: &Map<String, Value>) -> LimitDetail {
    let refi = obj.get("contratoRefinanciamento").and_then(Value::as_object);
    let refi_field = |k: &str| refi.and_then(|r| r.get(k));

    LimitDetail {
        subject_id: None,
        relationship_id: None,
        name: text(obj.get("nome")),
        phone: None,
        registration: text(obj.get("matricula")),
        withdrawal_multiple: number(obj.get("vlMultiploSaque")),
        limit_used: number(obj.get("limiteUtilizado")),
        limit_total: number(obj.get("limiteTotal")),
        limit_available: number(obj.get("limiteDisponivel")),
        installment_limit: number(obj.get("vlLimiteParcela")),
        installment_limit_used: number(obj.get("limiteParcelaUtilizado")),
        installment_limit_available: number(obj.get("limiteParcelaDisponivel")),
        margin: number(obj.get("vlMargem")),
        purchase_multiple: number(obj.get("vlMultiploCompra")),
        purchase_limit: number(obj.get("vlLimiteCompra")),
        bank_code: text(obj.get("cdBanco")),
        branch_code: text(obj.get("cdAgencia")),
        account_code: text(obj.get("cdConta")),
        do_not_disturb: flag(obj.get("naoPerturbe")),
        supplementary_withdrawal: flag(obj.get("saqueComplementar")),
        refinancing: refi_field("refinanciamento").filter(|v| !v.is_null()).cloned(),
        refinancing_contracts: text(refi_field("numeroContratos")),
        refinancing_max_installment: number(refi_field("vlMaximoParcela")),
        refinancing_contract_value: number(refi_field("valor")),
        option: Map::new(),
    }
}

/// Strings as-is, numbers and booleans rendered; null and containers are absent.
fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    v.and_then(scalar_string)
}

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn flag(v: Option<&Value>) -> Option<bool> {
    match v? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "s" | "sim" | "1" => Some(true),
            "false" | "n" | "nao" | "não" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn link() -> RelationshipLink {
        RelationshipLink {
            id: Some(1),
            subject_id: "12345678900".into(),
            relationship_id: "184".into(),
            resolved_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn stage_one_collects_every_relationship_id() {
        let payload = json!([{ "idConvenio": "184" }, { "nome": "x" }, { "idConvenio": 77 }]);
        assert_eq!(
            relationship_ids(&payload),
            Linkage::Found(vec!["184".into(), "77".into()])
        );
    }

    #[test]
    fn stage_one_without_ids_is_no_linkage() {
        assert_eq!(relationship_ids(&json!([])), Linkage::NotFound);
        assert_eq!(
            relationship_ids(&json!([{ "idConvenio": null }])),
            Linkage::NotFound
        );
    }

    #[test]
    fn stage_one_object_is_malformed() {
        assert!(matches!(
            relationship_ids(&json!({ "message": "oops" })),
            Linkage::Malformed(_)
        ));
    }

    #[test]
    fn options_fan_out_with_shared_base_fields() {
        let payload = json!([{
            "cpf": "12345678900",
            "idConvenio": "184",
            "nome": "Maria",
            "limiteTotal": 1000.0,
            "naoPerturbe": false,
            "contratoRefinanciamento": {
                "refinanciamento": true,
                "numeroContratos": "2",
                "vlMaximoParcela": 250.5,
                "valor": 4000
            },
            "opcoes": [{ "taxa": 1.5 }, { "taxa": 1.8, "prazo": 84 }]
        }]);

        let LimitRows::Rows(rows) = limit_details(&payload, &link(), Some("11987654321")) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.name.as_deref(), Some("Maria"));
            assert_eq!(row.limit_total, Some(1000.0));
            assert_eq!(row.refinancing, Some(json!(true)));
            assert_eq!(row.refinancing_contracts.as_deref(), Some("2"));
            assert_eq!(row.refinancing_max_installment, Some(250.5));
            assert_eq!(row.refinancing_contract_value, Some(4000.0));
            assert_eq!(row.phone.as_deref(), Some("11987654321"));
            assert_eq!(row.do_not_disturb, Some(false));
        }
        assert_eq!(rows[0].option["taxa"], 1.5);
        assert_eq!(rows[1].option["prazo"], 84);
    }

    #[test]
    fn entry_without_options_yields_one_row() {
        let payload = json!([{ "limiteDisponivel": "350,25" }]);
        let LimitRows::Rows(rows) = limit_details(&payload, &link(), None) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].limit_available, Some(350.25));
        assert_eq!(rows[0].subject_id.as_deref(), Some("12345678900"));
        assert_eq!(rows[0].relationship_id.as_deref(), Some("184"));
        assert!(rows[0].option.is_empty());
    }

    #[test]
    fn rows_carry_link_ids_not_partner_echo() {
        let payload = json!([{
            "cpf": "123.456.789-00",
            "idConvenio": "0184",
            "opcoes": [{ "taxa": 1.5 }]
        }]);
        let LimitRows::Rows(rows) = limit_details(&payload, &link(), None) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject_id.as_deref(), Some("12345678900"));
        assert_eq!(rows[0].relationship_id.as_deref(), Some("184"));
    }

    #[test]
    fn empty_and_malformed_stage_two() {
        assert_eq!(limit_details(&json!([]), &link(), None), LimitRows::Empty);
        assert!(matches!(
            limit_details(&json!("maintenance"), &link(), None),
            LimitRows::Malformed(_)
        ));
        assert!(matches!(
            limit_details(&json!([1, 2]), &link(), None),
            LimitRows::Malformed(_)
        ));
    }
}
