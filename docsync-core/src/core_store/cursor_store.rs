//! Sync cursors: the last acknowledged ordinal per remote and direction

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::database::{AbortSignal, Database};
use super::errors::{StoreError, StoreResult};
use super::types::{now_utc_ms, Ordinal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorType {
    Inbox,
    Outbox,
}

impl CursorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorType::Inbox => "inbox",
            CursorType::Outbox => "outbox",
        }
    }
}

impl fmt::Display for CursorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CursorType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbox" => Ok(CursorType::Inbox),
            "outbox" => Ok(CursorType::Outbox),
            other => Err(StoreError::Serialization(format!("unknown cursor type {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub remote_name: String,
    pub cursor_type: CursorType,
    pub cursor_ordinal: Ordinal,
    pub last_synced_at_utc_ms: u64,
}

impl SyncCursor {
    pub fn new(remote_name: impl Into<String>, cursor_type: CursorType, cursor_ordinal: Ordinal) -> Self {
        Self {
            remote_name: remote_name.into(),
            cursor_type,
            cursor_ordinal,
            last_synced_at_utc_ms: now_utc_ms(),
        }
    }

    /// Cursor of a remote that never acknowledged anything
    pub fn zero(remote_name: impl Into<String>, cursor_type: CursorType) -> Self {
        Self {
            remote_name: remote_name.into(),
            cursor_type,
            cursor_ordinal: 0,
            last_synced_at_utc_ms: 0,
        }
    }
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn list(&self, remote_name: &str, signal: Option<&AbortSignal>) -> StoreResult<Vec<SyncCursor>>;

    /// Stored cursor, or a zero cursor when none was written yet
    async fn get(
        &self,
        remote_name: &str,
        cursor_type: CursorType,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<SyncCursor>;

    /// Write a cursor. Cursors only move forward: a lower ordinal than the
    /// stored one is ignored.
    async fn upsert(&self, cursor: &SyncCursor, signal: Option<&AbortSignal>) -> StoreResult<()>;

    async fn remove(&self, remote_name: &str, signal: Option<&AbortSignal>) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct SqlCursorStore {
    db: Database,
}

impl SqlCursorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CursorStore for SqlCursorStore {
    async fn list(&self, remote_name: &str, signal: Option<&AbortSignal>) -> StoreResult<Vec<SyncCursor>> {
        let remote = remote_name.to_string();

        let rows: Vec<(String, i64, i64)> = self
            .db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT cursor_type, cursor_ordinal, last_synced_at_utc_ms FROM sync_cursors
                     WHERE remote_name = ? ORDER BY cursor_type",
                )?;
                let rows = stmt
                    .query_map(params![remote], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(cursor_type, ordinal, synced)| -> StoreResult<SyncCursor> {
                Ok(SyncCursor {
                    remote_name: remote_name.to_string(),
                    cursor_type: cursor_type.parse()?,
                    cursor_ordinal: ordinal as u64,
                    last_synced_at_utc_ms: synced as u64,
                })
            })
            .collect()
    }

    async fn get(
        &self,
        remote_name: &str,
        cursor_type: CursorType,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<SyncCursor> {
        let remote = remote_name.to_string();

        let row: Option<(i64, i64)> = self
            .db
            .run(signal, move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT cursor_ordinal, last_synced_at_utc_ms FROM sync_cursors
                         WHERE remote_name = ? AND cursor_type = ?",
                        params![remote, cursor_type.as_str()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?)
            })
            .await?;

        Ok(match row {
            Some((ordinal, synced)) => SyncCursor {
                remote_name: remote_name.to_string(),
                cursor_type,
                cursor_ordinal: ordinal as u64,
                last_synced_at_utc_ms: synced as u64,
            },
            None => SyncCursor::zero(remote_name, cursor_type),
        })
    }

    async fn upsert(&self, cursor: &SyncCursor, signal: Option<&AbortSignal>) -> StoreResult<()> {
        let cursor = cursor.clone();

        self.db
            .run(signal, move |conn| {
                conn.execute(
                    "INSERT INTO sync_cursors (remote_name, cursor_type, cursor_ordinal, last_synced_at_utc_ms)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(remote_name, cursor_type) DO UPDATE SET
                        cursor_ordinal = MAX(cursor_ordinal, excluded.cursor_ordinal),
                        last_synced_at_utc_ms = excluded.last_synced_at_utc_ms",
                    params![
                        cursor.remote_name,
                        cursor.cursor_type.as_str(),
                        cursor.cursor_ordinal as i64,
                        cursor.last_synced_at_utc_ms as i64
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, remote_name: &str, signal: Option<&AbortSignal>) -> StoreResult<()> {
        let remote = remote_name.to_string();

        self.db
            .run(signal, move |conn| {
                conn.execute("DELETE FROM sync_cursors WHERE remote_name = ?", params![remote])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqlCursorStore {
        SqlCursorStore::new(Database::memory().unwrap())
    }

    #[tokio::test]
    async fn test_missing_cursor_is_zero() {
        let store = store();
        let cursor = store.get("remote", CursorType::Outbox, None).await.unwrap();
        assert_eq!(cursor, SyncCursor::zero("remote", CursorType::Outbox));
        assert!(store.list("remote", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_only_moves_forward() {
        let store = store();

        store.upsert(&SyncCursor::new("remote", CursorType::Inbox, 10), None).await.unwrap();
        store.upsert(&SyncCursor::new("remote", CursorType::Inbox, 4), None).await.unwrap();
        store.upsert(&SyncCursor::new("remote", CursorType::Outbox, 7), None).await.unwrap();

        let inbox = store.get("remote", CursorType::Inbox, None).await.unwrap();
        assert_eq!(inbox.cursor_ordinal, 10);

        let cursors = store.list("remote", None).await.unwrap();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[1].cursor_type, CursorType::Outbox);
        assert_eq!(cursors[1].cursor_ordinal, 7);
    }

    #[tokio::test]
    async fn test_remove_drops_both_directions() {
        let store = store();
        store.upsert(&SyncCursor::new("a", CursorType::Inbox, 1), None).await.unwrap();
        store.upsert(&SyncCursor::new("a", CursorType::Outbox, 2), None).await.unwrap();
        store.upsert(&SyncCursor::new("b", CursorType::Inbox, 3), None).await.unwrap();

        store.remove("a", None).await.unwrap();
        assert!(store.list("a", None).await.unwrap().is_empty());
        assert_eq!(store.list("b", None).await.unwrap().len(), 1);
    }

    #[test]
    fn test_cursor_type_parse() {
        assert_eq!("inbox".parse::<CursorType>().unwrap(), CursorType::Inbox);
        assert!("sideways".parse::<CursorType>().is_err());
    }
}
