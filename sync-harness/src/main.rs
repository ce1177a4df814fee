//! Sync harness binary
//!
//! Runs two in-process reactors connected by an internal or a polling
//! channel pair, writes counter increments on both sides (optionally while
//! the polling transport is down) and reports whether both converged.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use docsync_core::core_store::{now_utc_ms, Database, ViewFilter, GLOBAL_SCOPE};
use docsync_core::core_sync::{
    ChannelConfig, ChannelRegistry, LocalTransport, RemoteFilter, RemoteOptions, TransportRegistry,
};
use docsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use docsync_core::test_utils::fixtures::{increment, CounterModel, COUNTER_TYPE};
use docsync_core::test_utils::wait_until;
use docsync_core::{Config, Reactor, ReactorBuilder};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Pairing {
    Internal,
    Polling,
}

#[derive(Parser, Debug)]
#[command(name = "sync-harness")]
#[command(about = "Two-reactor convergence scenario", long_about = None)]
struct Args {
    /// How the two reactors are connected
    #[arg(long, value_enum, default_value = "polling")]
    channel: Pairing,

    /// Documents created on the first reactor
    #[arg(long, default_value_t = 3)]
    documents: usize,

    /// Increments written per side and document
    #[arg(long, default_value_t = 10)]
    writes: usize,

    /// Take the polling transport down while the second half of the writes happen
    #[arg(long)]
    outage: bool,

    /// Poll interval of the polling channel, in milliseconds
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,

    /// Seconds to wait for convergence
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize)]
struct DocumentReport {
    document_id: String,
    expected: i64,
    a: Option<i64>,
    b: Option<i64>,
}

#[derive(Debug, Serialize)]
struct Report {
    channel: String,
    outage: bool,
    converged: bool,
    elapsed_ms: u128,
    documents: Vec<DocumentReport>,
}

fn config(args: &Args) -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.sync.poll_interval = Duration::from_millis(args.poll_ms);
    config.sync.retry_base_delay = Duration::from_millis(args.poll_ms);
    config.sync.retry_max_delay = Duration::from_millis(args.poll_ms * 10);
    config.sync.max_failures = u32::MAX;
    config.sync.buffer_window = Duration::from_millis(10);
    config
}

async fn reactor(config: Config, channels: &ChannelRegistry, transports: &TransportRegistry) -> Result<Reactor> {
    Ok(ReactorBuilder::new()
        .with_config(config)
        .with_database(Database::memory()?)
        .with_model(Arc::new(CounterModel::default()))
        .with_sync(channels.clone(), transports.clone())
        .build()
        .await?)
}

/// Wire `a` and `b` together; returns the transport when polling
async fn connect(
    pairing: Pairing,
    a: &Reactor,
    b: &Reactor,
    transports: &TransportRegistry,
) -> Result<Option<Arc<LocalTransport>>> {
    match pairing {
        Pairing::Internal => {
            a.sync()?
                .add_with_id(
                    "a-to-b",
                    "b",
                    "harness",
                    ChannelConfig::internal("b-to-a"),
                    RemoteFilter::default(),
                    RemoteOptions::default(),
                )
                .await?;
            b.sync()?
                .add_with_id(
                    "b-to-a",
                    "a",
                    "harness",
                    ChannelConfig::internal("a-to-b"),
                    RemoteFilter::default(),
                    RemoteOptions::default(),
                )
                .await?;
            Ok(None)
        }
        Pairing::Polling => {
            let url = "local://b";
            let transport = Arc::new(LocalTransport::new(b.sync_service()?));
            transports.register(url, transport.clone());
            a.sync()?
                .add(
                    "b",
                    "harness",
                    ChannelConfig::polling(url, &a.config().sync),
                    RemoteFilter::default(),
                    RemoteOptions::default(),
                )
                .await?;
            Ok(Some(transport))
        }
    }
}

/// Increment stamped with `timestamp_utc_ms`. Callers hand out strictly
/// increasing timestamps in program order, so a local write is never older
/// than an operation already received from the peer.
async fn write(reactor: &Reactor, document_id: &str, by: i64, timestamp_utc_ms: u64) -> Result<()> {
    let action = increment(by).with_timestamp(timestamp_utc_ms);
    let info = reactor.mutate(document_id, "main", vec![action])?;
    let info = reactor.wait_for_job(&info.id, None).await?;
    if let Some(error) = info.error() {
        bail!("write to {} failed: {}", document_id, error);
    }
    Ok(())
}

async fn global_state(reactor: &Reactor, document_id: &str) -> Option<Value> {
    reactor
        .get(document_id, &ViewFilter::default())
        .await
        .ok()
        .and_then(|document| document.state.get(GLOBAL_SCOPE).cloned())
}

async fn count(reactor: &Reactor, document_id: &str) -> Option<i64> {
    global_state(reactor, document_id).await.and_then(|state| state["count"].as_i64())
}

async fn in_sync(a: &Reactor, b: &Reactor, documents: &[String], expected: i64) -> bool {
    for document_id in documents {
        let (left, right) = (global_state(a, document_id).await, global_state(b, document_id).await);
        match (left, right) {
            (Some(left), Some(right)) if left == right && left["count"].as_i64() == Some(expected) => {}
            _ => return false,
        }
    }
    true
}

async fn run(args: &Args) -> Result<Report> {
    if args.outage && args.channel != Pairing::Polling {
        bail!("--outage needs --channel polling");
    }

    let channels = ChannelRegistry::new();
    let transports = TransportRegistry::new();
    let a = reactor(config(args), &channels, &transports).await?;
    let b = reactor(config(args), &channels, &transports).await?;
    let transport = connect(args.channel, &a, &b, &transports).await?;

    let started = Instant::now();
    let timeout = Duration::from_secs(args.timeout);

    let mut documents = Vec::with_capacity(args.documents);
    for i in 0..args.documents {
        let document_id = format!("doc-{}", i);
        let info = a.create(COUNTER_TYPE, Some(&document_id))?;
        a.wait_for_job(&info.id, None).await?;
        documents.push(document_id);
    }

    let b_ref = &b;
    let docs_ref = &documents;
    let visible = wait_until(timeout, move || async move {
        for document_id in docs_ref {
            if b_ref.get(document_id, &ViewFilter::default()).await.is_err() {
                return false;
            }
        }
        true
    })
    .await;
    if !visible {
        bail!("documents never reached the second reactor");
    }

    let mut clock = now_utc_ms();
    for round in 0..args.writes {
        if args.outage && round == args.writes / 2 {
            if let Some(transport) = &transport {
                warn!("taking transport offline");
                transport.set_online(false);
            }
        }
        for document_id in &documents {
            write(&a, document_id, 1, clock + 1).await?;
            write(&b, document_id, 10, clock + 2).await?;
            clock += 2;
        }
    }
    if let Some(transport) = &transport {
        if !transport.is_online() {
            info!("bringing transport back online");
            transport.set_online(true);
        }
    }

    let expected = 11 * args.writes as i64;
    let (a_ref, b_ref) = (&a, &b);
    let converged = wait_until(timeout, move || async move { in_sync(a_ref, b_ref, docs_ref, expected).await }).await;

    let mut reports = Vec::with_capacity(documents.len());
    for document_id in &documents {
        reports.push(DocumentReport {
            document_id: document_id.clone(),
            expected,
            a: count(&a, document_id).await,
            b: count(&b, document_id).await,
        });
    }

    a.kill().await;
    b.kill().await;

    Ok(Report {
        channel: format!("{:?}", args.channel).to_lowercase(),
        outage: args.outage,
        converged,
        elapsed_ms: started.elapsed().as_millis(),
        documents: reports,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = args.log_level.parse::<LogLevel>()?;
    init_logging_with_config(LogConfig::new(level))?;

    let report = run(&args).await.context("scenario failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.converged {
        bail!("reactors did not converge within {}s", args.timeout);
    }
    info!(elapsed_ms = report.elapsed_ms as u64, "reactors converged");
    Ok(())
}
