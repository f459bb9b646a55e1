//! quarry-demo
//!
//! Drives a quarry client against an in-memory todo service and prints the
//! final cached view as JSON. Useful for watching the engine's logs:
//!
//! ```bash
//! RUST_LOG=quarry_engine=debug quarry-demo --todos 5 --fail-every 4
//! ```
//!
//! Engine settings come from `QUARRY_*` environment variables (see
//! `ClientConfig::from_env`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use quarry_engine::{
    combine2, Client, ClientConfig, CombineOptions, ManualConnectivity, Marker, NetworkStatus,
    Status,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod keys;
mod transport;

use keys::{flatten, AddTodo, TodoChunks, TodoCount, TodoFeed, TodoPages};
use transport::{MemoryTransport, Todo};

/// Walk through queries, mutations, paging, a subscription and a reconnect.
#[derive(Debug, Parser)]
#[command(name = "quarry-demo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of todos to add.
    #[arg(long, default_value_t = 5)]
    todos: usize,

    /// Todos per page.
    #[arg(long, default_value_t = 2)]
    page_size: usize,

    /// Simulated round-trip latency in milliseconds.
    #[arg(long, env = "QUARRY_DEMO_LATENCY_MS", default_value_t = 20)]
    latency_ms: u64,

    /// Fail every Nth transport call with a transient error.
    #[arg(long, env = "QUARRY_DEMO_FAIL_EVERY")]
    fail_every: Option<u32>,

    /// Skip the simulated network drop.
    #[arg(long)]
    no_reconnect: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    count: Option<usize>,
    todos: Vec<Todo>,
    streamed: Option<Todo>,
    transport_calls: u32,
    cache_entries: usize,
    cache_hits: u64,
    cache_misses: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = ClientConfig::from_env().context("loading client config")?;
    info!(
        stale_time_ms = config.stale_time.as_millis(),
        gc_time_ms = config.gc_time.map(|d| d.as_millis()),
        max_retries = config.retry.max_retries,
        "Configuration loaded"
    );

    let transport = MemoryTransport::new(Duration::from_millis(args.latency_ms), args.fail_every);
    let client = Client::new(transport, config);
    let network = Arc::new(ManualConnectivity::new(NetworkStatus::Available));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background loops
    let gc_handle = tokio::spawn({
        let client = client.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { client.run_gc(shutdown_rx).await }
    });
    let network_handle = tokio::spawn({
        let client = client.clone();
        let network = Arc::clone(&network);
        let shutdown_rx = shutdown_rx.clone();
        async move { client.run_network_resume(network.as_ref(), shutdown_rx).await }
    });
    let relay_handle = tokio::spawn({
        let mut errors = client.errors();
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            loop {
                tokio::select! {
                    record = errors.recv() => match record {
                        Ok(record) => warn!(
                            kind = %record.kind,
                            key = %record.key,
                            marker = %record.marker,
                            error = %record.error,
                            "Operation failed"
                        ),
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    // Observed views
    let count = client.get_query(TodoCount::new()?, Marker::new("header"))?;
    let pages = client.get_infinite_query(TodoPages::new(args.page_size)?, Marker::new("list"))?;
    let feed = client.get_subscription(TodoFeed::new()?, Marker::new("toast"))?;
    let mut feed_rx = feed.subscribe();

    count.resume().await?;
    pages.resume().await?;
    feed.resume().await?;
    count.join().await;
    pages.join().await;
    feed.join().await;
    info!(count = ?count.state().reply, "Initial load done");

    // Writes
    let add = client.get_mutation(AddTodo::new()?, Marker::new("composer"))?;
    for i in 1..=args.todos {
        match add.mutate(format!("todo #{i}")).await {
            Ok(Some(todo)) => info!(id = todo.id, title = %todo.title, "Todo added"),
            Ok(None) => info!("Add dropped"),
            Err(e) => warn!(error = %e, "Add failed"),
        }
    }
    count.join().await;
    pages.join().await;

    // Page through everything
    loop {
        let before = pages.revision();
        pages.load_more().await?;
        pages.join().await;
        if pages.revision() == before {
            break;
        }
    }

    if !args.no_reconnect {
        let _observer = count.subscribe();
        network.set(NetworkStatus::Lost);
        tokio::time::sleep(Duration::from_millis(50)).await;
        network.set(NetworkStatus::Available);
        tokio::time::sleep(client.config().network_resume_delay + Duration::from_millis(100))
            .await;
        count.join().await;
    }

    let dashboard = combine2(
        CombineOptions::default(),
        count.clone(),
        pages.clone(),
        |count: &usize, chunks: &TodoChunks| {
            let loaded: usize = chunks.iter().map(|c| c.data.len()).sum();
            (*count, loaded)
        },
    );
    dashboard.join().await;
    let dashboard_state = dashboard.state();
    if dashboard_state.status == Status::Success {
        info!(dashboard = ?dashboard_state.reply, "Dashboard ready");
    } else {
        warn!(status = ?dashboard_state.status, error = ?dashboard_state.error, "Dashboard incomplete");
    }

    let streamed = feed_rx.borrow_and_update().reply.get().cloned();
    let (cache_hits, cache_misses, _) = client.store().stats();
    let summary = Summary {
        count: count.state().reply.into_option(),
        todos: flatten(&pages.state().reply),
        streamed,
        transport_calls: client.receiver().calls(),
        cache_entries: client.store().len(),
        cache_hits,
        cache_misses,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    drop(dashboard);
    client.close();
    for handle in [gc_handle, network_handle, relay_handle] {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task panicked");
        }
    }

    info!("Demo complete");
    Ok(())
}
