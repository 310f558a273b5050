//! Auth token log. Append-only; "current token" is the newest row that
//! carries a token.

use super::{now, EnrichStore};
use crate::{error::EnrichResult, types::AuthTokenRecord};
use rusqlite::{params, OptionalExtension};

impl EnrichStore {
    pub fn append_auth_token_record(
        &self,
        token: Option<&str>,
        exception: Option<&str>,
    ) -> EnrichResult<()> {
        self.conn.execute(
            "INSERT INTO auth_token (token, exception, created_at) VALUES (?1, ?2, ?3)",
            params![token, exception, now()],
        )?;
        Ok(())
    }

    /// Newest successful fetch. Failure rows (exception only) are skipped.
    pub fn latest_auth_token_record(&self) -> EnrichResult<Option<AuthTokenRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, token, exception, created_at FROM auth_token
                 WHERE token IS NOT NULL
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                |r| {
                    Ok(AuthTokenRecord {
                        id: Some(r.get(0)?),
                        token: r.get(1)?,
                        exception: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn auth_token_record_count(&self) -> EnrichResult<i64> {
        self.count("SELECT COUNT(*) FROM auth_token")
    }
}
