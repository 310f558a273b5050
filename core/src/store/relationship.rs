//! Relationship link queries.

use super::{now, EnrichStore};
use crate::{error::EnrichResult, types::RelationshipLink};
use rusqlite::params;

impl EnrichStore {
    pub fn append_relationship_link(&self, cpf: &str, relationship_id: &str) -> EnrichResult<RelationshipLink> {
        let resolved_at = now();
        self.conn.execute(
            "INSERT INTO relationship_link (cpf, id_convenio, resolved_at) VALUES (?1, ?2, ?3)",
            params![cpf, relationship_id, resolved_at],
        )?;
        Ok(RelationshipLink {
            id: Some(self.conn.last_insert_rowid()),
            subject_id: cpf.to_string(),
            relationship_id: relationship_id.to_string(),
            resolved_at,
        })
    }

    pub fn relationship_links_for(&self, cpf: &str) -> EnrichResult<Vec<RelationshipLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cpf, id_convenio, resolved_at FROM relationship_link
             WHERE cpf = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![cpf], map_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest link per (cpf, id_convenio) that has neither limit rows
    /// nor a stage-2 failure yet.
    pub fn list_resolved_relationships(&self) -> EnrichResult<Vec<RelationshipLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT MAX(r.id), r.cpf, r.id_convenio, MAX(r.resolved_at)
             FROM relationship_link r
             WHERE NOT EXISTS (SELECT 1 FROM limit_detail d
                               WHERE d.cpf = r.cpf AND d.id_convenio = r.id_convenio)
               AND NOT EXISTS (SELECT 1 FROM failure_report f
                               WHERE f.cpf = r.cpf AND f.id_convenio = r.id_convenio)
             GROUP BY r.cpf, r.id_convenio
             ORDER BY MAX(r.id)",
        )?;
        let rows = stmt
            .query_map([], map_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn relationship_link_count(&self) -> EnrichResult<i64> {
        self.count("SELECT COUNT(*) FROM relationship_link")
    }
}

fn map_link(r: &rusqlite::Row<'_>) -> rusqlite::Result<RelationshipLink> {
    Ok(RelationshipLink {
        id: Some(r.get(0)?),
        subject_id: r.get(1)?,
        relationship_id: r.get(2)?,
        resolved_at: r.get(3)?,
    })
}
