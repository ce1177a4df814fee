/*
    Shared setup for the sync integration tests: reactors with fast timers,
    channel pairs and convergence checks.
*/

#![allow(dead_code)]

use docsync_core::config::Config;
use docsync_core::core_model::DocumentModel;
use docsync_core::core_queue::{JobInfo, JobStatus};
use docsync_core::core_store::{Action, Database, ViewFilter, GLOBAL_SCOPE};
use docsync_core::core_sync::{
    ChannelConfig, ChannelRegistry, LocalTransport, RemoteFilter, RemoteOptions, TransportRegistry,
};
use docsync_core::test_utils::fixtures::{increment, COUNTER_TYPE};
use docsync_core::test_utils::{wait_until, DEFAULT_TEST_TIMEOUT};
use docsync_core::{Reactor, ReactorBuilder};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Timers short enough for tests on the real clock
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.sync.poll_interval = Duration::from_millis(20);
    config.sync.retry_base_delay = Duration::from_millis(10);
    config.sync.retry_max_delay = Duration::from_millis(50);
    config.sync.max_failures = 1000;
    config.sync.buffer_window = Duration::from_millis(5);
    config
}

pub async fn memory_reactor(
    model: Arc<dyn DocumentModel>,
    channels: &ChannelRegistry,
    transports: &TransportRegistry,
) -> Reactor {
    ReactorBuilder::new()
        .with_config(fast_config())
        .with_database(Database::memory().unwrap())
        .with_model(model)
        .with_sync(channels.clone(), transports.clone())
        .build()
        .await
        .unwrap()
}

pub async fn file_reactor(
    path: &Path,
    model: Arc<dyn DocumentModel>,
    channels: &ChannelRegistry,
    transports: &TransportRegistry,
) -> Reactor {
    let mut config = fast_config();
    config.storage.database_path = path.to_path_buf();
    ReactorBuilder::new()
        .with_config(config)
        .with_model(model)
        .with_sync(channels.clone(), transports.clone())
        .build()
        .await
        .unwrap()
}

/// Connect two reactors with a pair of internal channels; `a` knows `b` as
/// "b" and `b` knows `a` as "a"
pub async fn connect_internal(a: &Reactor, b: &Reactor) {
    a.sync()
        .unwrap()
        .add_with_id(
            "a-to-b",
            "b",
            "drive",
            ChannelConfig::internal("b-to-a"),
            RemoteFilter::default(),
            RemoteOptions::default(),
        )
        .await
        .unwrap();
    b.sync()
        .unwrap()
        .add_with_id(
            "b-to-a",
            "a",
            "drive",
            ChannelConfig::internal("a-to-b"),
            RemoteFilter::default(),
            RemoteOptions::default(),
        )
        .await
        .unwrap();
}

/// Serve `responder` at `url` and make `caller` poll it as remote "b"
pub async fn connect_polling(
    caller: &Reactor,
    responder: &Reactor,
    transports: &TransportRegistry,
    url: &str,
) -> Arc<LocalTransport> {
    let transport = Arc::new(LocalTransport::new(responder.sync_service().unwrap()));
    transports.register(url, transport.clone());

    let config = ChannelConfig::polling(url, &caller.config().sync);
    caller
        .sync()
        .unwrap()
        .add("b", "drive", config, RemoteFilter::default(), RemoteOptions::default())
        .await
        .unwrap();
    transport
}

pub async fn completed(reactor: &Reactor, info: JobInfo) -> JobInfo {
    let info = reactor.wait_for_job(&info.id, None).await.unwrap();
    assert_eq!(info.status, JobStatus::Completed, "job failed: {:?}", info.error());
    info
}

pub async fn create_counter(reactor: &Reactor, document_id: &str) {
    let info = reactor.create(COUNTER_TYPE, Some(document_id)).unwrap();
    completed(reactor, info).await;
}

pub async fn apply(reactor: &Reactor, document_id: &str, actions: Vec<Action>) {
    let info = reactor.mutate(document_id, "main", actions).unwrap();
    completed(reactor, info).await;
}

/// Increment with a fixed action id and timestamp
pub fn step(by: i64, id: &str, timestamp_utc_ms: u64) -> Action {
    increment(by).with_id(id).with_timestamp(timestamp_utc_ms)
}

/// Global scope state, if the document is visible yet
pub async fn global_state(reactor: &Reactor, document_id: &str) -> Option<Value> {
    reactor
        .get(document_id, &ViewFilter::default())
        .await
        .ok()
        .and_then(|document| document.state.get(GLOBAL_SCOPE).cloned())
}

pub async fn count(reactor: &Reactor, document_id: &str) -> Option<i64> {
    global_state(reactor, document_id)
        .await
        .and_then(|state| state["count"].as_i64())
}

/// Wait until both reactors hold the same global state with the expected count
pub async fn converged(a: &Reactor, b: &Reactor, document_id: &str, expected: i64) -> bool {
    wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
        let (left, right) = (global_state(a, document_id).await, global_state(b, document_id).await);
        match (left, right) {
            (Some(left), Some(right)) => left == right && left["count"].as_i64() == Some(expected),
            _ => false,
        }
    })
    .await
}

/// Wait until the document exists on `reactor`
pub async fn visible(reactor: &Reactor, document_id: &str) -> bool {
    wait_until(DEFAULT_TEST_TIMEOUT, move || async move {
        reactor.get(document_id, &ViewFilter::default()).await.is_ok()
    })
    .await
}
