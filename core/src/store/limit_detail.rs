//! Limit detail rows and the filtered export.

use super::{now, EnrichStore};
use crate::{
    error::{EnrichError, EnrichResult},
    types::LimitDetail,
};
use rusqlite::params;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Numeric columns an export may filter on.
const FILTERABLE_COLUMNS: &[&str] = &[
    "vl_multiplo_saque",
    "limite_utilizado",
    "limite_total",
    "limite_disponivel",
    "vl_limite_parcela",
    "limite_parcela_utilizado",
    "limite_parcela_disponivel",
    "vl_margem",
    "vl_multiplo_compra",
    "vl_limite_compra",
    "vl_maximo_parcela",
    "vl_contrato",
];

const SELECT_COLUMNS: &str = "id, cpf, id_convenio, nome, phone, matricula,
    vl_multiplo_saque, limite_utilizado, limite_total, limite_disponivel,
    vl_limite_parcela, limite_parcela_utilizado, limite_parcela_disponivel,
    vl_margem, vl_multiplo_compra, vl_limite_compra, cd_banco, cd_agencia, cd_conta,
    nao_perturbe, saque_complementar, refinanciamento, numero_contratos,
    vl_maximo_parcela, vl_contrato, option_json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
        }
    }
}

impl FromStr for FilterOp {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">"  => Ok(FilterOp::Gt),
            "<"  => Ok(FilterOp::Lt),
            ">=" => Ok(FilterOp::Ge),
            "<=" => Ok(FilterOp::Le),
            "==" => Ok(FilterOp::Eq),
            "!=" => Ok(FilterOp::Ne),
            other => Err(EnrichError::Config(format!("invalid filter operator '{other}'"))),
        }
    }
}

/// `column <op> value` over one of the numeric limit columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportFilter {
    column: &'static str,
    op:     FilterOp,
    value:  f64,
}

impl ExportFilter {
    pub fn new(column: &str, op: FilterOp, value: f64) -> EnrichResult<Self> {
        let column = FILTERABLE_COLUMNS
            .iter()
            .copied()
            .find(|c| *c == column)
            .ok_or_else(|| EnrichError::Config(format!("column '{column}' cannot be filtered")))?;
        Ok(Self { column, op, value })
    }
}

impl EnrichStore {
    pub fn append_limit_detail(&self, d: &LimitDetail) -> EnrichResult<()> {
        let refinancing = d.refinancing.as_ref().map(Value::to_string);
        let option_json = Value::Object(d.option.clone()).to_string();
        self.conn.execute(
            "INSERT INTO limit_detail (
                cpf, id_convenio, nome, phone, matricula,
                vl_multiplo_saque, limite_utilizado, limite_total, limite_disponivel,
                vl_limite_parcela, limite_parcela_utilizado, limite_parcela_disponivel,
                vl_margem, vl_multiplo_compra, vl_limite_compra,
                cd_banco, cd_agencia, cd_conta, nao_perturbe, saque_complementar,
                refinanciamento, numero_contratos, vl_maximo_parcela, vl_contrato,
                option_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                d.subject_id,
                d.relationship_id,
                d.name,
                d.phone,
                d.registration,
                d.withdrawal_multiple,
                d.limit_used,
                d.limit_total,
                d.limit_available,
                d.installment_limit,
                d.installment_limit_used,
                d.installment_limit_available,
                d.margin,
                d.purchase_multiple,
                d.purchase_limit,
                d.bank_code,
                d.branch_code,
                d.account_code,
                d.do_not_disturb,
                d.supplementary_withdrawal,
                refinancing,
                d.refinancing_contracts,
                d.refinancing_max_installment,
                d.refinancing_contract_value,
                option_json,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn limit_details_for(&self, cpf: &str) -> EnrichResult<Vec<LimitDetail>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM limit_detail WHERE cpf = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cpf], map_limit_detail)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?.1);
        }
        Ok(result)
    }

    /// Every limit row (with its row id), optionally filtered.
    pub fn export_limit_details(
        &self,
        filter: Option<&ExportFilter>,
    ) -> EnrichResult<Vec<(i64, LimitDetail)>> {
        let rows = match filter {
            Some(f) => {
                // Column and operator come from closed sets, never from raw input.
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM limit_detail WHERE {} {} ?1 ORDER BY id",
                    f.column,
                    f.op.sql()
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![f.value], map_limit_detail)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM limit_detail ORDER BY id");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], map_limit_detail)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn limit_detail_count(&self) -> EnrichResult<i64> {
        self.count("SELECT COUNT(*) FROM limit_detail")
    }
}

fn map_limit_detail(r: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, LimitDetail)> {
    let refinancing: Option<String> = r.get(21)?;
    let option_json: String = r.get(25)?;
    let option = match serde_json::from_str::<Value>(&option_json) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    Ok((
        r.get(0)?,
        LimitDetail {
            subject_id: r.get(1)?,
            relationship_id: r.get(2)?,
            name: r.get(3)?,
            phone: r.get(4)?,
            registration: r.get(5)?,
            withdrawal_multiple: r.get(6)?,
            limit_used: r.get(7)?,
            limit_total: r.get(8)?,
            limit_available: r.get(9)?,
            installment_limit: r.get(10)?,
            installment_limit_used: r.get(11)?,
            installment_limit_available: r.get(12)?,
            margin: r.get(13)?,
            purchase_multiple: r.get(14)?,
            purchase_limit: r.get(15)?,
            bank_code: r.get(16)?,
            branch_code: r.get(17)?,
            account_code: r.get(18)?,
            do_not_disturb: r.get(19)?,
            supplementary_withdrawal: r.get(20)?,
            refinancing: refinancing.and_then(|s| serde_json::from_str(&s).ok()),
            refinancing_contracts: r.get(22)?,
            refinancing_max_installment: r.get(23)?,
            refinancing_contract_value: r.get(24)?,
            option,
        },
    ))
}
