//! Command implementations
//!
//! Document commands run against a reactor built without sync; remote and
//! cursor commands edit the sync tables directly, so a reactor started later
//! over the same database picks the changes up.

use anyhow::{bail, Context, Result};
use docsync_core::core_queue::{JobInfo, JobStatus};
use docsync_core::core_store::{
    Action, CursorStore, Database, PagingOptions, RemoteStore, SqlCursorStore, SqlRemoteStore, ViewFilter,
    StoreError,
};
use docsync_core::core_sync::{ChannelConfig, RemoteFilter, RemoteOptions, RemoteRecord, RemoteStatus};
use docsync_core::{Config, Reactor, ReactorBuilder};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::JsonModel;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn open_reactor(config: &Config) -> Result<Reactor> {
    ReactorBuilder::new()
        .with_config(config.clone())
        .with_model(Arc::new(JsonModel))
        .build()
        .await
        .with_context(|| format!("failed to open {}", config.storage.database_path.display()))
}

async fn finish(reactor: &Reactor, info: JobInfo) -> Result<JobInfo> {
    let info = reactor.wait_for_job(&info.id, None).await?;
    if let JobStatus::Failed { error } = &info.status {
        bail!("job {} failed: {}", info.id, error);
    }
    debug!(job_id = %info.id, operations = info.operations.len(), "job completed");
    Ok(info)
}

pub async fn create(reactor: &Reactor, document_type: &str, id: Option<&str>) -> Result<String> {
    let info = finish(reactor, reactor.create(document_type, id)?).await?;
    info!(document_id = %info.document_id, document_type, "document created");
    Ok(info.document_id)
}

pub async fn apply(
    reactor: &Reactor,
    document_id: &str,
    branch: &str,
    scope: &str,
    action_type: &str,
    input: &str,
) -> Result<JobInfo> {
    let input: Value = serde_json::from_str(input).context("action input is not valid JSON")?;
    let action = Action::new(action_type, scope, input);
    finish(reactor, reactor.mutate(document_id, branch, vec![action])?).await
}

pub async fn delete(reactor: &Reactor, document_id: &str) -> Result<()> {
    finish(reactor, reactor.delete_document(document_id)?).await?;
    info!(document_id, "document deleted");
    Ok(())
}

pub fn view_filter(branch: &str, scopes: Vec<String>) -> ViewFilter {
    ViewFilter {
        branch: branch.to_string(),
        scopes,
    }
}

pub async fn show(reactor: &Reactor, document_id: &str, filter: &ViewFilter) -> Result<()> {
    print_json(&reactor.get(document_id, filter).await?)
}

pub async fn operations(reactor: &Reactor, document_id: &str, filter: &ViewFilter, limit: Option<usize>) -> Result<()> {
    let paging = limit.map(PagingOptions::limit);
    print_json(&reactor.get_operations(document_id, filter, paging.as_ref()).await?)
}

pub async fn find(reactor: &Reactor, document_type: &str, limit: Option<usize>) -> Result<()> {
    let paging = limit.map(PagingOptions::limit);
    print_json(&reactor.find(document_type, paging.as_ref()).await?)
}

pub struct NewRemote {
    pub name: String,
    pub collection_id: String,
    pub channel: ChannelConfig,
    pub filter: RemoteFilter,
    pub since_timestamp_utc_ms: Option<u64>,
}

pub async fn add_remote(db: &Database, remote: NewRemote) -> Result<RemoteRecord> {
    let store = SqlRemoteStore::new(db.clone());
    match store.get(&remote.name, None).await {
        Ok(_) => bail!("remote '{}' already exists", remote.name),
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let record = RemoteRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: remote.name,
        collection_id: remote.collection_id,
        channel_config: remote.channel,
        filter: remote.filter,
        options: RemoteOptions {
            since_timestamp_utc_ms: remote.since_timestamp_utc_ms,
        },
        status: RemoteStatus::default(),
    };
    store.upsert(&record, None).await?;
    info!(remote = %record.name, channel = record.channel_config.kind(), "remote added");
    Ok(record)
}

pub async fn remove_remote(db: &Database, name: &str) -> Result<()> {
    let remotes = SqlRemoteStore::new(db.clone());
    remotes
        .get(name, None)
        .await
        .with_context(|| format!("remote '{}' not found", name))?;
    remotes.remove(name, None).await?;
    SqlCursorStore::new(db.clone()).remove(name, None).await?;
    info!(remote = %name, "remote removed");
    Ok(())
}

pub async fn list_remotes(db: &Database) -> Result<Vec<RemoteRecord>> {
    Ok(SqlRemoteStore::new(db.clone()).list(None).await?)
}

pub async fn cursors(db: &Database, name: &str) -> Result<()> {
    print_json(&SqlCursorStore::new(db.clone()).list(name, None).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JSON_TYPE;
    use docsync_core::core_store::{CursorType, SyncCursor, GLOBAL_SCOPE};
    use serde_json::json;
    use tempfile::tempdir;

    fn config(path: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.database_path = path.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_create_apply_and_read_back() {
        let dir = tempdir().unwrap();
        let reactor = open_reactor(&config(&dir.path().join("cli.db"))).await.unwrap();

        let id = create(&reactor, JSON_TYPE, Some("notes")).await.unwrap();
        assert_eq!(id, "notes");
        apply(&reactor, "notes", "main", GLOBAL_SCOPE, "SET", r#"{"key":"title","value":"hello"}"#)
            .await
            .unwrap();

        let document = reactor.get("notes", &view_filter("main", vec![])).await.unwrap();
        assert_eq!(document.state[GLOBAL_SCOPE], json!({ "title": "hello" }));
        reactor.kill().await;
    }

    #[tokio::test]
    async fn test_failed_job_is_an_error() {
        let dir = tempdir().unwrap();
        let reactor = open_reactor(&config(&dir.path().join("cli.db"))).await.unwrap();
        create(&reactor, JSON_TYPE, Some("notes")).await.unwrap();

        let err = apply(&reactor, "notes", "main", GLOBAL_SCOPE, "RENAME", "{}").await.unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert!(apply(&reactor, "notes", "main", GLOBAL_SCOPE, "SET", "not json").await.is_err());
        reactor.kill().await;
    }

    #[tokio::test]
    async fn test_remote_add_list_remove() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("cli.db"), 1).unwrap();

        let remote = || NewRemote {
            name: "peer".into(),
            collection_id: "main".into(),
            channel: ChannelConfig::Polled,
            filter: RemoteFilter::default(),
            since_timestamp_utc_ms: None,
        };
        add_remote(&db, remote()).await.unwrap();
        assert!(add_remote(&db, remote()).await.is_err());
        assert_eq!(list_remotes(&db).await.unwrap().len(), 1);

        let cursors = SqlCursorStore::new(db.clone());
        cursors
            .upsert(&SyncCursor::new("peer", CursorType::Inbox, 7), None)
            .await
            .unwrap();

        remove_remote(&db, "peer").await.unwrap();
        assert!(list_remotes(&db).await.unwrap().is_empty());
        assert!(cursors.list("peer", None).await.unwrap().is_empty());
        assert!(remove_remote(&db, "peer").await.is_err());
    }
}
