//! SQLite persistence layer (the Result Store).
//!
//! RULE: Only the store talks to the database.
//! The engine calls store methods and never executes SQL directly.
//!
//! One `EnrichStore` wraps one connection. Workers never share a
//! store: each opens its own connection to the same file.

use crate::error::EnrichResult;
use chrono::{Local, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

mod auth_token;
mod failure;
mod limit_detail;
mod relationship;
mod subject;

pub use limit_detail::{ExportFilter, FilterOp};
pub use subject::PurgeTarget;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EnrichStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl EnrichStore {
    pub fn open(path: &str) -> EnrichResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EnrichResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> EnrichResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => {
                let store = Self::in_memory()?;
                store.migrate()?;
                Ok(store)
            }
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order. Safe to repeat.
    pub fn migrate(&self) -> EnrichResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_enrichment.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, subject_count: usize, version: &str) -> EnrichResult<()> {
        self.conn.execute(
            "INSERT INTO enrichment_run (run_id, subject_count, version, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, subject_count as i64, version, now()],
        )?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &str) -> EnrichResult<()> {
        self.conn.execute(
            "UPDATE enrichment_run SET finished_at = ?1 WHERE run_id = ?2",
            params![now(), run_id],
        )?;
        Ok(())
    }

    pub fn run_finished(&self, run_id: &str) -> EnrichResult<bool> {
        let finished: Option<Option<NaiveDateTime>> = self
            .conn
            .query_row(
                "SELECT finished_at FROM enrichment_run WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(matches!(finished, Some(Some(_))))
    }

    fn count(&self, sql: &str) -> EnrichResult<i64> {
        Ok(self.conn.query_row(sql, [], |r| r.get(0))?)
    }
}

/// Local wall-clock timestamp stamped onto every appended row.
pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
