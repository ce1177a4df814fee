//! Document read model
//!
//! Folds written operations into one snapshot row per (documentId, scope,
//! branch) holding the scope's latest state. The executor indexes every write
//! before completing its job, so reads observe local writes immediately; on
//! startup the view catches up from the last ordinal it recorded.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::meta_cache::DocumentMetaCache;
use crate::core_model::is_deleted;
use crate::core_store::{
    AbortSignal, Database, Operation, OperationStore, OperationWithContext, Ordinal, PagedResults, PagingOptions,
    StoreError, StoreResult, StreamKey, ViewFilter, DOCUMENT_SCOPE,
};

const CATCH_UP_PAGE: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHeader {
    pub id: String,
    pub document_type: String,
    pub branch: String,
    pub created_at_utc_ms: u64,
    pub last_modified_at_utc_ms: u64,
    /// Head revision per scope
    pub revision: BTreeMap<String, u64>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub header: DocumentHeader,
    /// Scope → state
    pub state: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub document_type: String,
    pub content: Value,
    pub last_operation_index: u64,
    pub last_operation_hash: String,
    pub created_at_utc_ms: u64,
    pub last_updated_at_utc_ms: u64,
    pub snapshot_version: u64,
    pub deleted: bool,
}

pub struct DocumentView {
    db: Database,
    store: Arc<dyn OperationStore>,
    cache: DocumentMetaCache,
}

impl DocumentView {
    pub fn new(db: Database, store: Arc<dyn OperationStore>, cache_capacity: usize) -> Self {
        Self {
            db,
            store,
            cache: DocumentMetaCache::new(cache_capacity),
        }
    }

    pub async fn last_ordinal(&self, signal: Option<&AbortSignal>) -> StoreResult<Ordinal> {
        let ordinal: Option<i64> = self
            .db
            .run(signal, |conn| {
                Ok(conn
                    .query_row("SELECT last_ordinal FROM view_state WHERE id = 1", [], |row| row.get(0))
                    .optional()?)
            })
            .await?;
        Ok(ordinal.unwrap_or(0) as Ordinal)
    }

    /// Index every operation written since the last recorded ordinal.
    /// Returns the number of operations indexed.
    pub async fn init(&self, signal: Option<&AbortSignal>) -> StoreResult<usize> {
        let mut cursor = self.last_ordinal(signal).await?;
        let mut indexed = 0;

        loop {
            let page = self
                .store
                .get_since_id(cursor, Some(&PagingOptions::limit(CATCH_UP_PAGE)), signal)
                .await?;

            if let Some(last) = page.results.last() {
                cursor = last.context.ordinal;
            }
            indexed += page.results.len();
            self.index_operations(&page.results, signal).await?;

            if page.next_cursor.is_none() {
                break;
            }
        }

        if indexed > 0 {
            info!(indexed, last_ordinal = cursor, "document view caught up");
        }
        Ok(indexed)
    }

    /// Fold written operations into their snapshots.
    ///
    /// Idempotent: a snapshot only moves forward to a higher operation index.
    pub async fn index_operations(
        &self,
        items: &[OperationWithContext],
        signal: Option<&AbortSignal>,
    ) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let items = items.to_vec();
        let touched: BTreeSet<String> = items.iter().map(|i| i.context.document_id.clone()).collect();

        self.db
            .run(signal, move |conn| {
                let tx = conn.transaction()?;
                let mut max_ordinal = 0;

                for item in &items {
                    max_ordinal = max_ordinal.max(item.context.ordinal);
                    let op = &item.operation;
                    let ctx = &item.context;

                    let Some(state) = &op.resulting_state else {
                        warn!(op_id = %op.id, stream = %ctx.stream(), "operation without resulting state not indexed");
                        continue;
                    };

                    tx.execute(
                        "INSERT INTO document_snapshots (document_id, scope, branch, document_type, content, last_operation_index, last_operation_hash, created_at_utc_ms, last_updated_at_utc_ms, snapshot_version, deleted)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 1, 0)
                         ON CONFLICT(document_id, scope, branch) DO UPDATE SET
                            content = excluded.content,
                            last_operation_index = excluded.last_operation_index,
                            last_operation_hash = excluded.last_operation_hash,
                            last_updated_at_utc_ms = excluded.last_updated_at_utc_ms,
                            snapshot_version = document_snapshots.snapshot_version + 1
                         WHERE excluded.last_operation_index > document_snapshots.last_operation_index",
                        params![
                            ctx.document_id,
                            ctx.scope,
                            ctx.branch,
                            ctx.document_type,
                            serde_json::to_string(state)?,
                            op.index as i64,
                            op.hash,
                            op.timestamp_utc_ms as i64,
                        ],
                    )?;

                    if ctx.scope == DOCUMENT_SCOPE && is_deleted(state) {
                        tx.execute(
                            "UPDATE document_snapshots SET deleted = 1 WHERE document_id = ?",
                            params![ctx.document_id],
                        )?;
                    }
                }

                tx.execute(
                    "INSERT INTO view_state (id, last_ordinal) VALUES (1, ?)
                     ON CONFLICT(id) DO UPDATE SET last_ordinal = MAX(last_ordinal, excluded.last_ordinal)",
                    params![max_ordinal as i64],
                )?;

                tx.commit()?;
                Ok(())
            })
            .await?;

        for document_id in touched {
            self.cache.invalidate(&document_id);
        }
        Ok(())
    }

    async fn load_snapshots(
        &self,
        document_id: &str,
        branch: &str,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<Vec<DocumentSnapshot>> {
        let document = document_id.to_string();
        let branch = branch.to_string();

        let rows: Vec<(String, String, String, String, String, i64, String, i64, i64, i64, bool)> = self
            .db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT document_id, scope, branch, document_type, content, last_operation_index, last_operation_hash,
                            created_at_utc_ms, last_updated_at_utc_ms, snapshot_version, deleted
                     FROM document_snapshots WHERE document_id = ? AND branch = ? ORDER BY scope",
                )?;
                let rows = stmt
                    .query_map(params![document, branch], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<DocumentSnapshot> {
                let (document_id, scope, branch, document_type, content, index, hash, created, updated, version, deleted) =
                    row;
                Ok(DocumentSnapshot {
                    document_id,
                    scope,
                    branch,
                    document_type,
                    content: serde_json::from_str(&content)?,
                    last_operation_index: index as u64,
                    last_operation_hash: hash,
                    created_at_utc_ms: created as u64,
                    last_updated_at_utc_ms: updated as u64,
                    snapshot_version: version as u64,
                    deleted,
                })
            })
            .collect()
    }

    fn header_from(document_id: &str, branch: &str, snapshots: &[DocumentSnapshot]) -> StoreResult<DocumentHeader> {
        let first = snapshots
            .first()
            .ok_or_else(|| StoreError::NotFound(format!("document {} on branch {}", document_id, branch)))?;

        let created_at_utc_ms = snapshots
            .iter()
            .find(|s| s.scope == DOCUMENT_SCOPE)
            .map(|s| s.created_at_utc_ms)
            .unwrap_or(first.created_at_utc_ms);

        Ok(DocumentHeader {
            id: document_id.to_string(),
            document_type: first.document_type.clone(),
            branch: branch.to_string(),
            created_at_utc_ms,
            last_modified_at_utc_ms: snapshots.iter().map(|s| s.last_updated_at_utc_ms).max().unwrap_or(0),
            revision: snapshots
                .iter()
                .map(|s| (s.scope.clone(), s.last_operation_index + 1))
                .collect(),
            deleted: snapshots.iter().any(|s| s.deleted),
        })
    }

    pub async fn get_header(
        &self,
        document_id: &str,
        branch: &str,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<DocumentHeader> {
        if let Some(header) = self.cache.get(document_id, branch) {
            return Ok(header);
        }

        let snapshots = self.load_snapshots(document_id, branch, signal).await?;
        let header = Self::header_from(document_id, branch, &snapshots)?;
        self.cache.put(header.clone());
        Ok(header)
    }

    pub async fn get(&self, document_id: &str, filter: &ViewFilter, signal: Option<&AbortSignal>) -> StoreResult<Document> {
        let snapshots = self.load_snapshots(document_id, &filter.branch, signal).await?;
        let header = Self::header_from(document_id, &filter.branch, &snapshots)?;
        self.cache.put(header.clone());

        let state = snapshots
            .into_iter()
            .filter(|s| filter.includes_scope(&s.scope))
            .map(|s| (s.scope, s.content))
            .collect();

        Ok(Document { header, state })
    }

    /// Documents that exist, in request order; missing ids are skipped
    pub async fn get_many(
        &self,
        document_ids: &[String],
        filter: &ViewFilter,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<Vec<Document>> {
        let mut documents = Vec::with_capacity(document_ids.len());
        for id in document_ids {
            match self.get(id, filter, signal).await {
                Ok(doc) => documents.push(doc),
                Err(StoreError::NotFound(_)) => debug!(document_id = %id, "skipping unknown document"),
                Err(e) => return Err(e),
            }
        }
        Ok(documents)
    }

    pub async fn exists(&self, document_ids: &[String], signal: Option<&AbortSignal>) -> StoreResult<Vec<bool>> {
        let ids = document_ids.to_vec();

        self.db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached("SELECT 1 FROM document_snapshots WHERE document_id = ? LIMIT 1")?;
                let mut found = Vec::with_capacity(ids.len());
                for id in &ids {
                    found.push(stmt.query_row(params![id], |_| Ok(())).optional()?.is_some());
                }
                Ok(found)
            })
            .await
    }

    /// Operations of each selected scope, ascending by index
    pub async fn get_operations(
        &self,
        document_id: &str,
        filter: &ViewFilter,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<BTreeMap<String, PagedResults<Operation>>> {
        let scopes: Vec<String> = if filter.scopes.is_empty() {
            self.get_header(document_id, &filter.branch, signal)
                .await?
                .revision
                .into_keys()
                .collect()
        } else {
            filter.scopes.clone()
        };

        let mut result = BTreeMap::new();
        for scope in scopes {
            let stream = StreamKey::new(document_id, &scope, &filter.branch);
            let page = self.store.get_since(&stream, 0, None, paging, signal).await?;
            result.insert(scope, page);
        }
        Ok(result)
    }

    pub async fn get_since_ordinal(
        &self,
        ordinal: Ordinal,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<OperationWithContext>> {
        self.store.get_since_id(ordinal, paging, signal).await
    }

    /// Ids of live documents of a type; the cursor is an offset
    pub async fn find_by_type(
        &self,
        document_type: &str,
        paging: Option<&PagingOptions>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<PagedResults<String>> {
        let document_type = document_type.to_string();
        let offset = paging.and_then(|p| p.cursor).unwrap_or(0);
        let limit = paging.and_then(|p| p.limit);
        let sql_limit = limit.map(|l| l as i64 + 1).unwrap_or(-1);

        let mut ids: Vec<String> = self
            .db
            .run(signal, move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT DISTINCT document_id FROM document_snapshots
                     WHERE document_type = ? AND deleted = 0
                     ORDER BY document_id LIMIT ? OFFSET ?",
                )?;
                let ids = stmt
                    .query_map(params![document_type, sql_limit, offset as i64], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await?;

        let next_cursor = match limit {
            Some(limit) if ids.len() > limit => {
                ids.truncate(limit);
                Some(offset + limit as u64)
            }
            _ => None,
        };

        Ok(PagedResults {
            results: ids,
            next_cursor,
        })
    }

    pub async fn mark_deleted(&self, document_id: &str, signal: Option<&AbortSignal>) -> StoreResult<()> {
        let document = document_id.to_string();
        self.db
            .run(signal, move |conn| {
                conn.execute(
                    "UPDATE document_snapshots SET deleted = 1 WHERE document_id = ?",
                    params![document],
                )?;
                Ok(())
            })
            .await?;
        self.cache.invalidate(document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::{write_all, OperationContext, SqlOperationStore, GLOBAL_SCOPE};
    use crate::test_utils::fixtures::make_operation;
    use serde_json::json;

    fn with_state(index: u64, action_id: &str, count: i64) -> Operation {
        let mut op = make_operation(index, action_id, 100 + index);
        op.resulting_state = Some(json!({ "count": count }));
        op.hash = format!("h{}", index);
        op
    }

    async fn setup() -> (Arc<SqlOperationStore>, DocumentView) {
        let db = Database::memory().unwrap();
        let store = Arc::new(SqlOperationStore::new(db.clone()));
        let view = DocumentView::new(db, store.clone(), 16);
        (store, view)
    }

    #[tokio::test]
    async fn test_index_and_get() {
        let (store, view) = setup().await;
        let stream = StreamKey::new("doc", GLOBAL_SCOPE, "main");

        let written = store
            .apply(&stream, "counter", 0, write_all(vec![with_state(0, "a0", 1), with_state(1, "a1", 2)]), None)
            .await
            .unwrap();
        view.index_operations(&written, None).await.unwrap();

        let doc = view.get("doc", &ViewFilter::default(), None).await.unwrap();
        assert_eq!(doc.header.document_type, "counter");
        assert_eq!(doc.header.revision.get(GLOBAL_SCOPE), Some(&2));
        assert_eq!(doc.state[GLOBAL_SCOPE], json!({ "count": 2 }));
        assert_eq!(view.last_ordinal(None).await.unwrap(), written[1].context.ordinal);
    }

    #[tokio::test]
    async fn test_indexing_is_idempotent_and_forward_only() {
        let (store, view) = setup().await;
        let stream = StreamKey::new("doc", GLOBAL_SCOPE, "main");

        let written = store
            .apply(&stream, "counter", 0, write_all(vec![with_state(0, "a0", 1), with_state(1, "a1", 2)]), None)
            .await
            .unwrap();

        view.index_operations(&written, None).await.unwrap();
        // Replaying an older operation leaves the newer snapshot in place.
        view.index_operations(&written[..1], None).await.unwrap();

        let doc = view.get("doc", &ViewFilter::default(), None).await.unwrap();
        assert_eq!(doc.state[GLOBAL_SCOPE], json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn test_init_catches_up_from_store() {
        let (store, view) = setup().await;
        let stream = StreamKey::new("doc", GLOBAL_SCOPE, "main");

        store
            .apply(&stream, "counter", 0, write_all(vec![with_state(0, "a0", 7)]), None)
            .await
            .unwrap();

        assert_eq!(view.init(None).await.unwrap(), 1);
        assert_eq!(view.init(None).await.unwrap(), 0);
        assert_eq!(view.exists(&["doc".into(), "missing".into()], None).await.unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_unknown_document_is_not_found() {
        let (_store, view) = setup().await;
        let err = view.get("nope", &ViewFilter::default(), None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let docs = view.get_many(&["nope".into()], &ViewFilter::default(), None).await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_documents_leave_find() {
        let (_store, view) = setup().await;

        let mut items = Vec::new();
        for (ordinal, doc) in ["a", "b"].iter().enumerate() {
            let mut op = with_state(0, &format!("create-{}", doc), 0);
            op.action.scope = DOCUMENT_SCOPE.into();
            op.resulting_state = Some(json!({ "documentType": "counter", "deleted": false }));
            items.push(OperationWithContext {
                operation: op,
                context: OperationContext {
                    document_id: doc.to_string(),
                    document_type: "counter".into(),
                    scope: DOCUMENT_SCOPE.into(),
                    branch: "main".into(),
                    ordinal: ordinal as u64 + 1,
                },
            });
        }
        view.index_operations(&items, None).await.unwrap();

        let found = view.find_by_type("counter", None, None).await.unwrap();
        assert_eq!(found.results, vec!["a".to_string(), "b".to_string()]);

        let page = view.find_by_type("counter", Some(&PagingOptions::limit(1)), None).await.unwrap();
        assert_eq!(page.results, vec!["a".to_string()]);
        assert_eq!(page.next_cursor, Some(1));

        view.mark_deleted("a", None).await.unwrap();
        let found = view.find_by_type("counter", None, None).await.unwrap();
        assert_eq!(found.results, vec!["b".to_string()]);
        assert!(view.get_header("a", "main", None).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_get_operations_by_scope() {
        let (store, view) = setup().await;
        let stream = StreamKey::new("doc", GLOBAL_SCOPE, "main");
        let written = store
            .apply(&stream, "counter", 0, write_all(vec![with_state(0, "a0", 1)]), None)
            .await
            .unwrap();
        view.index_operations(&written, None).await.unwrap();

        let ops = view.get_operations("doc", &ViewFilter::default(), None, None).await.unwrap();
        assert_eq!(ops[GLOBAL_SCOPE].results.len(), 1);

        let none = view
            .get_operations("doc", &ViewFilter::scopes(["local"]), None, None)
            .await
            .unwrap();
        assert!(none["local"].results.is_empty());
    }
}
