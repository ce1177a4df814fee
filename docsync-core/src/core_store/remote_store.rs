//! Persisted sync remotes

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use super::database::{AbortSignal, Database};
use super::errors::{StoreError, StoreResult};
use super::types::now_utc_ms;
use crate::core_sync::RemoteRecord;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, signal: Option<&AbortSignal>) -> StoreResult<Vec<RemoteRecord>>;

    /// Fails with `NotFound` for an unknown name
    async fn get(&self, name: &str, signal: Option<&AbortSignal>) -> StoreResult<RemoteRecord>;

    async fn upsert(&self, record: &RemoteRecord, signal: Option<&AbortSignal>) -> StoreResult<()>;

    async fn remove(&self, name: &str, signal: Option<&AbortSignal>) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct SqlRemoteStore {
    db: Database,
}

impl SqlRemoteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

type RemoteRow = (String, String, String, String, String, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RemoteRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode((name, id, collection_id, channel_config, filter, options, status): RemoteRow) -> StoreResult<RemoteRecord> {
    Ok(RemoteRecord {
        id,
        name,
        collection_id,
        channel_config: serde_json::from_str(&channel_config)?,
        filter: serde_json::from_str(&filter)?,
        options: serde_json::from_str(&options)?,
        status: serde_json::from_str(&status)?,
    })
}

#[async_trait]
impl RemoteStore for SqlRemoteStore {
    async fn list(&self, signal: Option<&AbortSignal>) -> StoreResult<Vec<RemoteRecord>> {
        let rows: Vec<RemoteRow> = self
            .db
            .run(signal, |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT name, id, collection_id, channel_config, filter, options, status
                     FROM sync_remotes ORDER BY created_at_utc_ms, name",
                )?;
                let rows = stmt.query_map([], read_row)?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(decode).collect()
    }

    async fn get(&self, name: &str, signal: Option<&AbortSignal>) -> StoreResult<RemoteRecord> {
        let key = name.to_string();

        let row: Option<RemoteRow> = self
            .db
            .run(signal, move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT name, id, collection_id, channel_config, filter, options, status
                         FROM sync_remotes WHERE name = ?",
                        params![key],
                        read_row,
                    )
                    .optional()?)
            })
            .await?;

        match row {
            Some(row) => decode(row),
            None => Err(StoreError::NotFound(format!("remote {}", name))),
        }
    }

    async fn upsert(&self, record: &RemoteRecord, signal: Option<&AbortSignal>) -> StoreResult<()> {
        let channel_config = serde_json::to_string(&record.channel_config)?;
        let filter = serde_json::to_string(&record.filter)?;
        let options = serde_json::to_string(&record.options)?;
        let status = serde_json::to_string(&record.status)?;
        let (name, id, collection_id) = (record.name.clone(), record.id.clone(), record.collection_id.clone());
        let now = now_utc_ms() as i64;

        self.db
            .run(signal, move |conn| {
                conn.execute(
                    "INSERT INTO sync_remotes (name, id, collection_id, channel_config, filter, options, status, created_at_utc_ms, updated_at_utc_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                     ON CONFLICT(name) DO UPDATE SET
                        id = excluded.id,
                        collection_id = excluded.collection_id,
                        channel_config = excluded.channel_config,
                        filter = excluded.filter,
                        options = excluded.options,
                        status = excluded.status,
                        updated_at_utc_ms = excluded.updated_at_utc_ms",
                    params![name, id, collection_id, channel_config, filter, options, status, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, name: &str, signal: Option<&AbortSignal>) -> StoreResult<()> {
        let key = name.to_string();

        self.db
            .run(signal, move |conn| {
                conn.execute("DELETE FROM sync_remotes WHERE name = ?", params![key])?;
                Ok(())
            })
            .await
    }
}
