//! Keyframes: cached scope states at a given revision, used to skip replaying
//! a stream from its first operation.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::database::{AbortSignal, Database};
use super::errors::StoreResult;
use super::types::{now_utc_ms, StreamKey};

#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    /// Number of operations folded into `document`
    pub revision: u64,
    pub document_type: String,
    pub document: Value,
}

#[async_trait]
pub trait KeyframeStore: Send + Sync {
    async fn put_keyframe(
        &self,
        stream: &StreamKey,
        revision: u64,
        document_type: &str,
        document: &Value,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<()>;

    /// Newest keyframe with `revision <= target_revision`
    async fn find_nearest_keyframe(
        &self,
        stream: &StreamKey,
        target_revision: u64,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<Option<Keyframe>>;

    /// Delete keyframes of a document, optionally narrowed to one scope and/or
    /// branch. Returns the number of rows removed.
    async fn delete_keyframes(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<usize>;
}

#[derive(Clone)]
pub struct SqlKeyframeStore {
    db: Database,
}

impl SqlKeyframeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyframeStore for SqlKeyframeStore {
    async fn put_keyframe(
        &self,
        stream: &StreamKey,
        revision: u64,
        document_type: &str,
        document: &Value,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<()> {
        let key = stream.clone();
        let document_type = document_type.to_string();
        let document = serde_json::to_string(document)?;

        self.db
            .run(signal, move |conn| {
                conn.execute(
                    "INSERT INTO keyframes (document_id, scope, branch, revision, document_type, document, created_at_utc_ms)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(document_id, scope, branch, revision) DO UPDATE SET
                        document_type = excluded.document_type,
                        document = excluded.document,
                        created_at_utc_ms = excluded.created_at_utc_ms",
                    params![
                        key.document_id,
                        key.scope,
                        key.branch,
                        revision as i64,
                        document_type,
                        document,
                        now_utc_ms() as i64
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn find_nearest_keyframe(
        &self,
        stream: &StreamKey,
        target_revision: u64,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<Option<Keyframe>> {
        let key = stream.clone();

        let row: Option<(i64, String, String)> = self
            .db
            .run(signal, move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT revision, document_type, document FROM keyframes
                         WHERE document_id = ? AND scope = ? AND branch = ? AND revision <= ?
                         ORDER BY revision DESC LIMIT 1",
                        params![key.document_id, key.scope, key.branch, target_revision as i64],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(revision, document_type, document)| -> StoreResult<Keyframe> {
            Ok(Keyframe {
                revision: revision as u64,
                document_type,
                document: serde_json::from_str(&document)?,
            })
        })
        .transpose()
    }

    async fn delete_keyframes(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
        signal: Option<&AbortSignal>,
    ) -> StoreResult<usize> {
        let document_id = document_id.to_string();
        let scope = scope.map(str::to_string);
        let branch = branch.map(str::to_string);

        self.db
            .run(signal, move |conn| {
                Ok(conn.execute(
                    "DELETE FROM keyframes
                     WHERE document_id = ?1 AND (?2 IS NULL OR scope = ?2) AND (?3 IS NULL OR branch = ?3)",
                    params![document_id, scope, branch],
                )?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::errors::StoreError;
    use serde_json::json;

    fn store() -> SqlKeyframeStore {
        SqlKeyframeStore::new(Database::memory().unwrap())
    }

    #[tokio::test]
    async fn test_find_nearest_at_or_below_target() {
        let store = store();
        let key = StreamKey::new("doc", "global", "main");

        store.put_keyframe(&key, 10, "counter", &json!({"count": 10}), None).await.unwrap();
        store.put_keyframe(&key, 20, "counter", &json!({"count": 20}), None).await.unwrap();

        assert!(store.find_nearest_keyframe(&key, 5, None).await.unwrap().is_none());

        let kf = store.find_nearest_keyframe(&key, 15, None).await.unwrap().unwrap();
        assert_eq!(kf.revision, 10);
        assert_eq!(kf.document, json!({"count": 10}));

        let kf = store.find_nearest_keyframe(&key, 20, None).await.unwrap().unwrap();
        assert_eq!(kf.revision, 20);
    }

    #[tokio::test]
    async fn test_put_overwrites_same_revision() {
        let store = store();
        let key = StreamKey::new("doc", "global", "main");

        store.put_keyframe(&key, 10, "counter", &json!({"count": 1}), None).await.unwrap();
        store.put_keyframe(&key, 10, "counter", &json!({"count": 2}), None).await.unwrap();

        let kf = store.find_nearest_keyframe(&key, 10, None).await.unwrap().unwrap();
        assert_eq!(kf.document, json!({"count": 2}));
    }

    #[tokio::test]
    async fn test_delete_keyframes_narrowing() {
        let store = store();
        let global = StreamKey::new("doc", "global", "main");
        let local = StreamKey::new("doc", "local", "main");
        let other = StreamKey::new("other", "global", "main");

        for key in [&global, &local, &other] {
            store.put_keyframe(key, 10, "counter", &json!({}), None).await.unwrap();
        }

        assert_eq!(store.delete_keyframes("doc", Some("local"), None, None).await.unwrap(), 1);
        assert_eq!(store.delete_keyframes("doc", None, Some("main"), None).await.unwrap(), 1);
        assert_eq!(store.delete_keyframes("doc", None, None, None).await.unwrap(), 0);
        assert!(store.find_nearest_keyframe(&other, 10, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_aborted() {
        let store = store();
        let signal = AbortSignal::new();
        signal.cancel();

        let err = store
            .delete_keyframes("doc", None, None, Some(&signal))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted));
    }
}
