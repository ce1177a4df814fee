//! Operation log
//!
//! One append-only log per (documentId, scope, branch) stream, stored in a
//! single `operations` table. Writes are optimistic: the caller names the
//! revision it expects the stream to be at and the whole batch is rejected if
//! the head moved. Every inserted row receives a global ordinal from SQLite's
//! AUTOINCREMENT rowid, which dependent indexes use for tailing.
//!
//! A stream's head revision is the index the next operation will carry:
//! 0 for an empty stream, `last.index + 1` otherwise.

use async_trait::async_trait;
use metrics::counter;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, warn};

use super::database::{check_aborted, AbortSignal, Database};
use super::errors::{StoreError, StoreResult};
use super::types::{
    now_utc_ms, Action, DocumentRevisions, Operation, OperationContext, OperationFilter, OperationWithContext,
    Ordinal, PagedResults, PagingOptions, StreamKey,
};
use crate::metrics::{DUPLICATE_OPERATIONS, OPERATIONS_APPLIED, REVISION_MISMATCHES};

/// Write batch handed to an `apply` writer
#[derive(Debug, Default)]
pub struct AtomicTxn {
    operations: Vec<Operation>,
}

impl AtomicTxn {
    pub fn add_operations<I>(&mut self, operations: I)
    where
        I: IntoIterator<Item = Operation>,
    {
        self.operations.extend(operations);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

/// Caller-supplied batch builder, run before the transaction opens
pub type TxnWriter = Box<dyn FnOnce(&mut AtomicTxn) + Send>;

/// Convenience writer for a prepared batch
pub fn write_all(operations: Vec<Operation>) -> TxnWriter {
    Box::new(move |txn| txn.add_operations(operations))
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Append the writer's batch atomically.
    ///
    /// Fails with `RevisionMismatch` if the stream head is not
    /// `expected_revision`, and with `DuplicateOperation` if any id already
    /// exists anywhere in the store. Nothing is written on failure.
    async fn apply(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        writer: TxnWriter,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<Vec<OperationWithContext>>;

    async fn get(&self, stream: &StreamKey, index: u64, signal: Option<&AbortSignal>) -> StoreResult<Operation>;

    /// Operations written after the stream was at `revision` (index >= revision),
    /// ascending by index.
    async fn get_since(
        &self,
        stream: &StreamKey,
        revision: u64,
        filter: Option<&OperationFilter>,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<Operation>>;

    /// Global tail: every operation with an ordinal greater than `ordinal`
    async fn get_since_id(
        &self,
        ordinal: Ordinal,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<OperationWithContext>>;

    /// Head revision per scope of one document branch
    async fn get_revisions(
        &self,
        document_id: &str,
        branch: &str,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<DocumentRevisions>;

    /// Operations with `timestamp_utc_ms >= min_timestamp_utc_ms`, ascending by index
    async fn get_conflicting(
        &self,
        stream: &StreamKey,
        min_timestamp_utc_ms: u64,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<Operation>>;

    async fn head_revision(&self, stream: &StreamKey, signal: Option<&AbortSignal>) -> StoreResult<u64>;

    /// Document type recorded with the document's first operation
    async fn get_document_type(&self, document_id: &str, signal: Option<&AbortSignal>) -> StoreResult<String>;
}

/// Every operation of a stream, following pages until exhausted
pub async fn read_stream(
    store: &dyn OperationStore,
    stream: &StreamKey,
    signal: Option<&AbortSignal>,
) -> StoreResult<Vec<Operation>> {
    const PAGE: usize = 1000;

    let mut operations = Vec::new();
    let mut paging = PagingOptions::limit(PAGE);

    loop {
        let page = store.get_since(stream, 0, None, Some(&paging), signal).await?;
        operations.extend(page.results);

        match page.next_cursor {
            Some(cursor) => paging = PagingOptions::after(cursor, PAGE),
            None => return Ok(operations),
        }
    }
}

const SELECT_COLUMNS: &str = "ordinal, op_id, prev_op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, resulting_state, error";

struct OperationRow {
    ordinal: i64,
    op_id: String,
    prev_op_id: Option<String>,
    document_id: String,
    document_type: String,
    scope: String,
    branch: String,
    index: i64,
    skip: i64,
    hash: String,
    action: String,
    timestamp_utc_ms: i64,
    resulting_state: Option<String>,
    error: Option<String>,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ordinal: row.get(0)?,
            op_id: row.get(1)?,
            prev_op_id: row.get(2)?,
            document_id: row.get(3)?,
            document_type: row.get(4)?,
            scope: row.get(5)?,
            branch: row.get(6)?,
            index: row.get(7)?,
            skip: row.get(8)?,
            hash: row.get(9)?,
            action: row.get(10)?,
            timestamp_utc_ms: row.get(11)?,
            resulting_state: row.get(12)?,
            error: row.get(13)?,
        })
    }

    fn into_operation_with_context(self) -> StoreResult<OperationWithContext> {
        let action: Action = serde_json::from_str(&self.action)?;
        let resulting_state = self.resulting_state.as_deref().map(serde_json::from_str).transpose()?;

        Ok(OperationWithContext {
            operation: Operation {
                id: self.op_id,
                index: self.index as u64,
                skip: self.skip as u64,
                hash: self.hash,
                timestamp_utc_ms: self.timestamp_utc_ms as u64,
                action,
                prev_op_id: self.prev_op_id,
                resulting_state,
                error: self.error,
            },
            context: OperationContext {
                document_id: self.document_id,
                document_type: self.document_type,
                scope: self.scope,
                branch: self.branch,
                ordinal: self.ordinal as u64,
            },
        })
    }
}

/// Fetch `limit + 1` rows to learn whether another page exists
fn page_of<T>(mut rows: Vec<T>, limit: Option<usize>, cursor_of: impl Fn(&T) -> u64) -> PagedResults<T> {
    match limit {
        Some(limit) if rows.len() > limit => {
            rows.truncate(limit);
            let next_cursor = rows.last().map(&cursor_of);
            PagedResults { results: rows, next_cursor }
        }
        _ => PagedResults {
            results: rows,
            next_cursor: None,
        },
    }
}

fn sql_limit(paging: Option<&PagingOptions>) -> i64 {
    paging
        .and_then(|p| p.limit)
        .map(|l| l as i64 + 1)
        .unwrap_or(-1)
}

fn sql_cursor(paging: Option<&PagingOptions>) -> i64 {
    paging.and_then(|p| p.cursor).map(|c| c as i64).unwrap_or(-1)
}

/// SQLite-backed operation log
#[derive(Clone)]
pub struct SqlOperationStore {
    db: Database,
}

impl SqlOperationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn query_stream(
        &self,
        sql: &'static str,
        stream: &StreamKey,
        bound: i64,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<Operation>> {
        let stream = stream.clone();
        let cursor = sql_cursor(paging);
        let limit = paging.and_then(|p| p.limit);
        let sql_limit = sql_limit(paging);

        let rows = self
            .db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached(sql)?;
                let rows = stmt
                    .query_map(
                        params![stream.document_id, stream.scope, stream.branch, bound, cursor, sql_limit],
                        OperationRow::from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let operations = rows
            .into_iter()
            .map(|row| row.into_operation_with_context().map(|o| o.operation))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(page_of(operations, limit, |op| op.index))
    }
}

#[async_trait]
impl OperationStore for SqlOperationStore {
    async fn apply(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        writer: TxnWriter,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<Vec<OperationWithContext>> {
        check_aborted(signal)?;

        let mut txn = AtomicTxn::default();
        writer(&mut txn);
        let operations = txn.operations;

        for (offset, op) in operations.iter().enumerate() {
            let expected_index = expected_revision + offset as u64;
            if op.index != expected_index {
                return Err(StoreError::InvalidOperation(format!(
                    "operation {} has index {}, expected {}",
                    op.id, op.index, expected_index
                )));
            }
            if op.action.scope != stream.scope {
                return Err(StoreError::InvalidOperation(format!(
                    "operation {} targets scope '{}' but was written to {}",
                    op.id, op.action.scope, stream
                )));
            }
        }

        let stream_key = stream.clone();
        let document_type = document_type.to_string();
        let count = operations.len();

        let result = self
            .db
            .run(signal, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let head: Option<i64> = tx.query_row(
                    "SELECT MAX(op_index) FROM operations WHERE document_id = ? AND scope = ? AND branch = ?",
                    params![stream_key.document_id, stream_key.scope, stream_key.branch],
                    |row| row.get(0),
                )?;
                let actual = head.map(|h| h as u64 + 1).unwrap_or(0);

                if actual != expected_revision {
                    return Err(StoreError::RevisionMismatch {
                        stream: stream_key,
                        expected: expected_revision,
                        actual,
                    });
                }

                let write_ts = now_utc_ms() as i64;
                let mut written = Vec::with_capacity(operations.len());

                for op in operations {
                    let exists = tx
                        .query_row("SELECT 1 FROM operations WHERE op_id = ?", params![op.id], |_| Ok(()))
                        .optional()?;
                    if exists.is_some() {
                        return Err(StoreError::DuplicateOperation(op.id));
                    }

                    let action = serde_json::to_string(&op.action)?;
                    let resulting_state = op.resulting_state.as_ref().map(serde_json::to_string).transpose()?;

                    tx.execute(
                        "INSERT INTO operations (op_id, prev_op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, resulting_state, error, write_timestamp_utc_ms)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            op.id,
                            op.prev_op_id,
                            stream_key.document_id,
                            document_type,
                            stream_key.scope,
                            stream_key.branch,
                            op.index as i64,
                            op.skip as i64,
                            op.hash,
                            action,
                            op.timestamp_utc_ms as i64,
                            resulting_state,
                            op.error,
                            write_ts,
                        ],
                    )?;

                    let context = OperationContext {
                        document_id: stream_key.document_id.clone(),
                        document_type: document_type.clone(),
                        scope: stream_key.scope.clone(),
                        branch: stream_key.branch.clone(),
                        ordinal: tx.last_insert_rowid() as u64,
                    };
                    written.push(OperationWithContext { operation: op, context });
                }

                tx.commit()?;
                Ok(written)
            })
            .await;

        match &result {
            Ok(_) => {
                counter!(OPERATIONS_APPLIED).increment(count as u64);
                debug!(stream = %stream, revision = expected_revision, count, "applied operations");
            }
            Err(StoreError::RevisionMismatch { expected, actual, .. }) => {
                counter!(REVISION_MISMATCHES).increment(1);
                debug!(stream = %stream, expected, actual, "revision mismatch");
            }
            Err(StoreError::DuplicateOperation(id)) => {
                counter!(DUPLICATE_OPERATIONS).increment(1);
                warn!(stream = %stream, op_id = %id, "duplicate operation rejected");
            }
            Err(_) => {}
        }

        result
    }

    async fn get(&self, stream: &StreamKey, index: u64, signal: Option<&AbortSignal>) -> StoreResult<Operation> {
        let key = stream.clone();

        let row = self
            .db
            .run(signal, move |conn| {
                let sql = format!(
                    "SELECT {} FROM operations WHERE document_id = ? AND scope = ? AND branch = ? AND op_index = ?",
                    SELECT_COLUMNS
                );
                Ok(conn
                    .query_row(
                        &sql,
                        params![key.document_id, key.scope, key.branch, index as i64],
                        OperationRow::from_row,
                    )
                    .optional()?)
            })
            .await?;

        match row {
            Some(row) => Ok(row.into_operation_with_context()?.operation),
            None => Err(StoreError::NotFound(format!("operation {} of {}", index, stream))),
        }
    }

    async fn get_since(
        &self,
        stream: &StreamKey,
        revision: u64,
        filter: Option<&OperationFilter>,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<Operation>> {
        match filter.and_then(|f| f.since_timestamp_utc_ms) {
            None => {
                self.query_stream(
                    "SELECT ordinal, op_id, prev_op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, resulting_state, error
                     FROM operations
                     WHERE document_id = ?1 AND scope = ?2 AND branch = ?3 AND op_index >= ?4 AND op_index > ?5
                     ORDER BY op_index ASC LIMIT ?6",
                    stream,
                    revision as i64,
                    paging,
                    signal,
                )
                .await
            }
            Some(since) => {
                let mut page = self
                    .query_stream(
                        "SELECT ordinal, op_id, prev_op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, resulting_state, error
                         FROM operations
                         WHERE document_id = ?1 AND scope = ?2 AND branch = ?3 AND timestamp_utc_ms > ?4 AND op_index > ?5
                         ORDER BY op_index ASC LIMIT ?6",
                        stream,
                        since as i64,
                        paging,
                        signal,
                    )
                    .await?;
                page.results.retain(|op| op.index >= revision);
                Ok(page)
            }
        }
    }

    async fn get_since_id(
        &self,
        ordinal: Ordinal,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<OperationWithContext>> {
        let cursor = sql_cursor(paging);
        let limit = paging.and_then(|p| p.limit);
        let sql_limit = sql_limit(paging);

        let rows = self
            .db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT ordinal, op_id, prev_op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, resulting_state, error
                     FROM operations
                     WHERE ordinal > ?1 AND ordinal > ?2
                     ORDER BY ordinal ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![ordinal as i64, cursor, sql_limit], OperationRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let items = rows
            .into_iter()
            .map(OperationRow::into_operation_with_context)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(page_of(items, limit, |item| item.context.ordinal))
    }

    async fn get_revisions(
        &self,
        document_id: &str,
        branch: &str,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<DocumentRevisions> {
        let document = document_id.to_string();
        let branch = branch.to_string();

        let rows: Vec<(String, i64, i64)> = self
            .db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT scope, MAX(op_index), MAX(timestamp_utc_ms) FROM operations
                     WHERE document_id = ? AND branch = ? GROUP BY scope",
                )?;
                let rows = stmt
                    .query_map(params![document, branch], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        if rows.is_empty() {
            return Err(StoreError::SynchronizationUnitNotFound(document_id.to_string()));
        }

        let mut revisions = DocumentRevisions::default();
        for (scope, max_index, max_ts) in rows {
            revisions.revision.insert(scope, max_index as u64 + 1);
            revisions.latest_timestamp_utc_ms = revisions.latest_timestamp_utc_ms.max(max_ts as u64);
        }

        Ok(revisions)
    }

    async fn get_conflicting(
        &self,
        stream: &StreamKey,
        min_timestamp_utc_ms: u64,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<Operation>> {
        self.query_stream(
            "SELECT ordinal, op_id, prev_op_id, document_id, document_type, scope, branch, op_index, skip, hash, action, timestamp_utc_ms, resulting_state, error
             FROM operations
             WHERE document_id = ?1 AND scope = ?2 AND branch = ?3 AND timestamp_utc_ms >= ?4 AND op_index > ?5
             ORDER BY op_index ASC LIMIT ?6",
            stream,
            min_timestamp_utc_ms as i64,
            paging,
            signal,
        )
        .await
    }

    async fn head_revision(&self, stream: &StreamKey, signal: Option<&AbortSignal>) -> StoreResult<u64> {
        let key = stream.clone();

        let head: Option<i64> = self
            .db
            .run(signal, move |conn| {
                Ok(conn.query_row(
                    "SELECT MAX(op_index) FROM operations WHERE document_id = ? AND scope = ? AND branch = ?",
                    params![key.document_id, key.scope, key.branch],
                    |row| row.get(0),
                )?)
            })
            .await?;

        Ok(head.map(|h| h as u64 + 1).unwrap_or(0))
    }

    async fn get_document_type(&self, document_id: &str, signal: Option<&AbortSignal>) -> StoreResult<String> {
        let document = document_id.to_string();

        let document_type: Option<String> = self
            .db
            .run(signal, move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT document_type FROM operations WHERE document_id = ? ORDER BY ordinal ASC LIMIT 1",
                        params![document],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        document_type.ok_or_else(|| StoreError::SynchronizationUnitNotFound(document_id.to_string()))
    }
}
