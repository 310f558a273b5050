//! Subject queue, pending-work queries, and the administrative purge.

use super::{now, EnrichStore};
use crate::{
    error::{EnrichError, EnrichResult},
    types::{Subject, SubjectId},
};
use rusqlite::{params, OptionalExtension};
use std::str::FromStr;

/// Tables the operator may empty, one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeTarget {
    FailureReports,
    RelationshipLinks,
    Subjects,
    TokenLog,
}

impl PurgeTarget {
    fn table(self) -> &'static str {
        match self {
            PurgeTarget::FailureReports    => "failure_report",
            PurgeTarget::RelationshipLinks => "relationship_link",
            PurgeTarget::Subjects          => "subject",
            PurgeTarget::TokenLog          => "auth_token",
        }
    }
}

impl FromStr for PurgeTarget {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failures" | "failure_report"        => Ok(PurgeTarget::FailureReports),
            "links" | "relationship_link"        => Ok(PurgeTarget::RelationshipLinks),
            "subjects" | "subject"               => Ok(PurgeTarget::Subjects),
            "tokens" | "auth_token"              => Ok(PurgeTarget::TokenLog),
            other => Err(EnrichError::Config(format!("unknown purge target '{other}'"))),
        }
    }
}

impl EnrichStore {
    /// Queue a subject for stage 1. Re-queuing keeps the first row but
    /// fills in a phone number if one was missing.
    pub fn enqueue_subject(&self, subject: &Subject) -> EnrichResult<()> {
        self.conn.execute(
            "INSERT INTO subject (cpf, phone, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(cpf) DO UPDATE SET phone = COALESCE(subject.phone, excluded.phone)",
            params![subject.id.as_str(), subject.phone, now()],
        )?;
        Ok(())
    }

    pub fn subject_phone(&self, cpf: &str) -> EnrichResult<Option<String>> {
        let phone: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT phone FROM subject WHERE cpf = ?1",
                params![cpf],
                |r| r.get(0),
            )
            .optional()?;
        Ok(phone.flatten())
    }

    /// Subjects with neither a relationship link nor a stage-1 failure.
    pub fn list_pending_subjects(&self) -> EnrichResult<Vec<Subject>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.cpf, s.phone FROM subject s
             WHERE NOT EXISTS (SELECT 1 FROM relationship_link r WHERE r.cpf = s.cpf)
               AND NOT EXISTS (SELECT 1 FROM failure_report f
                               WHERE f.cpf = s.cpf AND f.id_convenio IS NULL)
             ORDER BY s.rowid",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (cpf, phone) = row?;
            result.push(Subject { id: SubjectId::normalize(&cpf)?, phone });
        }
        Ok(result)
    }

    pub fn subject_count(&self) -> EnrichResult<i64> {
        self.count("SELECT COUNT(*) FROM subject")
    }

    /// Delete every row of one table. Operational use only.
    pub fn purge(&self, target: PurgeTarget) -> EnrichResult<usize> {
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM {}", target.table()), [])?;
        log::info!("Purged {deleted} rows from {}", target.table());
        Ok(deleted)
    }
}
