//! Failure report queries.

use super::{now, EnrichStore};
use crate::{error::EnrichResult, types::FailureReport};
use rusqlite::params;

impl EnrichStore {
    pub fn append_failure_report(
        &self,
        cpf: &str,
        relationship_id: Option<&str>,
        message: &str,
    ) -> EnrichResult<()> {
        self.conn.execute(
            "INSERT INTO failure_report (cpf, id_convenio, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![cpf, relationship_id, message, now()],
        )?;
        Ok(())
    }

    pub fn failure_reports_for(&self, cpf: &str) -> EnrichResult<Vec<FailureReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cpf, id_convenio, message, created_at FROM failure_report
             WHERE cpf = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cpf], |r| {
            Ok(FailureReport {
                id: Some(r.get(0)?),
                subject_id: r.get(1)?,
                relationship_id: r.get(2)?,
                message: r.get(3)?,
                created_at: r.get(4)?,
            })
        })?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    pub fn failure_report_count(&self) -> EnrichResult<i64> {
        self.count("SELECT COUNT(*) FROM failure_report")
    }
}
