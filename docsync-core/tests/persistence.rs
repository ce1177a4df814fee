/*
    persistence.rs - Restart of reactors over file-backed databases

    Remotes and cursors survive a restart: the rebuilt channels resume from
    the persisted ack ordinals instead of resending the whole log.
*/

mod common;

use common::*;
use docsync_core::core_store::{now_utc_ms, CursorStore, CursorType, Database, SqlCursorStore};
use docsync_core::core_sync::{ChannelRegistry, TransportRegistry};
use docsync_core::test_utils::fixtures::CounterModel;
use docsync_core::test_utils::{wait_until, DEFAULT_TEST_TIMEOUT};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

async fn persisted_cursor(path: &Path, remote: &str, cursor_type: CursorType) -> u64 {
    let store = SqlCursorStore::new(Database::open(path, 1).unwrap());
    store.get(remote, cursor_type, None).await.unwrap().cursor_ordinal
}

/// **Cursor persistence across restart**
///
/// 1. Two reactors sync a document over internal channels
/// 2. Both shut down once every cursor is on disk
/// 3. Both restart over the same files; remotes come back from storage
/// 4. New writes still converge and nothing already acknowledged is resent
#[tokio::test]
async fn test_restart_resumes_from_persisted_cursors() {
    let dir = tempdir().unwrap();
    let a_path = dir.path().join("a.db");
    let b_path = dir.path().join("b.db");

    let channels = ChannelRegistry::new();
    let transports = TransportRegistry::new();
    let a = file_reactor(&a_path, Arc::new(CounterModel::default()), &channels, &transports).await;
    let b = file_reactor(&b_path, Arc::new(CounterModel::default()), &channels, &transports).await;
    connect_internal(&a, &b).await;

    create_counter(&a, "doc").await;
    let base = now_utc_ms();
    apply(&a, "doc", vec![step(1, "before", base)]).await;
    assert!(converged(&a, &b, "doc", 1).await);

    let head = a.get_since_ordinal(0, None).await.unwrap().results.len() as u64;
    let (a_path_ref, b_path_ref) = (a_path.as_path(), b_path.as_path());
    assert!(
        wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
            persisted_cursor(a_path_ref, "b", CursorType::Outbox).await >= head
                && persisted_cursor(b_path_ref, "a", CursorType::Inbox).await >= head
        })
        .await,
        "cursors were not persisted"
    );

    a.kill().await;
    b.kill().await;
    drop(a);
    drop(b);

    let channels = ChannelRegistry::new();
    let a = file_reactor(&a_path, Arc::new(CounterModel::default()), &channels, &transports).await;
    let b = file_reactor(&b_path, Arc::new(CounterModel::default()), &channels, &transports).await;

    let remote = a.sync().unwrap().get_by_name("b").unwrap();
    assert!(remote.channel().outbox().ack_ordinal() >= head);
    assert!(remote.channel().outbox().is_empty(), "acknowledged operations were resent");
    assert_eq!(b.sync().unwrap().list().len(), 1);

    apply(&a, "doc", vec![step(2, "after", now_utc_ms())]).await;
    assert!(converged(&a, &b, "doc", 3).await);

    a.kill().await;
    b.kill().await;
}

/// **Document view survives restart**
#[tokio::test]
async fn test_documents_are_readable_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("solo.db");
    let channels = ChannelRegistry::new();
    let transports = TransportRegistry::new();

    let reactor = file_reactor(&path, Arc::new(CounterModel::default()), &channels, &transports).await;
    create_counter(&reactor, "doc").await;
    apply(&reactor, "doc", vec![step(4, "x", now_utc_ms())]).await;
    reactor.kill().await;
    drop(reactor);

    let reactor = file_reactor(&path, Arc::new(CounterModel::default()), &channels, &transports).await;
    assert_eq!(count(&reactor, "doc").await, Some(4));
    apply(&reactor, "doc", vec![step(1, "y", now_utc_ms())]).await;
    assert_eq!(count(&reactor, "doc").await, Some(5));
    reactor.kill().await;
}
