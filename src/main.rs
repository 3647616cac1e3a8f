#![allow(dead_code)]

mod client;
mod config;
mod db;
mod engine;
mod error;
mod graph;
mod rebalance;
mod scheduler;
mod tracker;

use clap::{Parser, Subcommand};
use config::Config;
use engine::Engine;
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use crate::client::{ClnRestClient, NodeClient};
use crate::rebalance::request::{CircularParams, NodeParams, PullParams, PushParams};

#[derive(Parser)]
#[command(
    name = "circular-boss",
    about = "Circular rebalancing engine for Core Lightning"
)]
struct Cli {
    /// Path to circular.toml config file
    #[arg(short, long, default_value = "circular.toml")]
    config: PathBuf,

    /// Seconds between full gossip refreshes (overrides the config file)
    #[arg(long = "circular-graph-refresh", global = true)]
    graph_refresh: Option<u64>,

    /// Seconds between own-channel refreshes (overrides the config file)
    #[arg(long = "circular-peer-refresh", global = true)]
    peer_refresh: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the graph fresh in the background until interrupted (default)
    Daemon,
    /// Rebalance from one own channel into another
    Circular(CircularParams),
    /// Pull liquidity into a channel from the best exits
    CircularPull(PullParams),
    /// Push liquidity out of a channel into the best entries
    CircularPush(PushParams),
    /// Rebalance between two peers, by node id or alias
    CircularNode(NodeParams),
    /// Print graph aggregates and recorded attempts
    CircularStats,
    /// Delete all recorded attempts and costs
    CircularDeleteStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(secs) = cli.graph_refresh {
        config.engine.graph_refresh_secs = secs;
    }
    if let Some(secs) = cli.peer_refresh {
        config.engine.peer_refresh_secs = secs;
    }
    config.validate()?;

    // Initialize logging; RUST_LOG wins over the config file
    env_logger::Builder::new()
        .filter_level(
            config
                .general
                .log_level
                .parse()
                .unwrap_or(log::LevelFilter::Info),
        )
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    info!("circular-boss v{} starting", env!("CARGO_PKG_VERSION"));

    let client = Arc::new(ClnRestClient::new(&config)?);
    let db = db::Database::open(&config.general.database_path)?;
    let engine = match Engine::start(client, &config, db).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Cannot reach the node: {:#}. Aborting.", e);
            return Err(e);
        }
    };

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(engine, &config).await,
        command => {
            let output = run_command(&engine, command).await?;
            println!("{}", output);
            Ok(())
        }
    }
}

async fn run_daemon<C: NodeClient + 'static>(
    engine: Arc<Engine<C>>,
    config: &Config,
) -> anyhow::Result<()> {
    let stats = engine.refresh_full().await?;
    info!(
        "Initial graph: {} nodes, {} channels ({} active)",
        stats.nodes, stats.channels, stats.active_channels
    );

    // Shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, stopping refresh timers...");
        let _ = shutdown_tx.send(true);
    });

    let scheduler = scheduler::RefreshScheduler::start(engine, &config.engine);
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    scheduler.stop().await;
    info!("Shutting down gracefully");
    Ok(())
}

/// Run a one-shot command on a freshly refreshed graph and render its
/// result as JSON.
async fn run_command<C: NodeClient>(engine: &Engine<C>, command: Commands) -> anyhow::Result<String> {
    match command {
        Commands::Daemon => anyhow::bail!("daemon is not a one-shot command"),
        Commands::CircularStats => {
            engine.refresh_full().await?;
            to_json(&engine.stats().await)
        }
        Commands::CircularDeleteStats => to_json(&engine.delete_stats().await?),
        Commands::Circular(params) => {
            refresh(engine).await?;
            to_json(&engine.circular(params).await?)
        }
        Commands::CircularPull(params) => {
            refresh(engine).await?;
            to_json(&engine.circular_pull(params).await?)
        }
        Commands::CircularPush(params) => {
            refresh(engine).await?;
            to_json(&engine.circular_push(params).await?)
        }
        Commands::CircularNode(params) => {
            refresh(engine).await?;
            to_json(&engine.circular_node(params).await?)
        }
    }
}

async fn refresh<C: NodeClient>(engine: &Engine<C>) -> anyhow::Result<()> {
    engine.refresh_full().await?;
    engine.refresh_peer_liquidity().await?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::client::mock::{gossip_pair, node_id, MockNode, SAT};
    use crate::client::{PaymentFailure, PaymentOutcome};
    use crate::db::Database;
    use crate::rebalance::request::ChunkParams;
    use crate::rebalance::SummaryStatus;

    const CL1: &str = "101x1x0";
    const CL2: &str = "102x1x0";
    const CL3: &str = "103x1x0";

    async fn ring_engine() -> (Arc<MockNode>, Engine<MockNode>) {
        let node = Arc::new(MockNode::ring());
        let config = Config::test_default(PathBuf::from("/dev/null"));
        let engine = Engine::start(node.clone(), &config, Database::open_in_memory().unwrap())
            .await
            .unwrap();
        engine.refresh_full().await.unwrap();
        (node, engine)
    }

    fn chunk(amount: u64, split: u64, maxppm: u64) -> ChunkParams {
        ChunkParams {
            amount: Some(amount),
            splitamount: Some(split),
            maxppm: Some(maxppm),
            attempts: None,
            maxhops: None,
        }
    }

    fn cl1_to_cl3(chunk: ChunkParams) -> Commands {
        Commands::Circular(CircularParams {
            outscid: CL1.to_string(),
            inscid: CL3.to_string(),
            chunk,
        })
    }

    fn set_local_balance(node: &MockNode, scid: &str, to_us_sat: u64) {
        let mut peers = node.peer_channels.lock().unwrap();
        if let Some(ch) = peers
            .iter_mut()
            .find(|c| c.short_channel_id.as_deref() == Some(scid))
        {
            ch.to_us_msat = to_us_sat * SAT;
            ch.spendable_msat = ch.to_us_msat;
            ch.receivable_msat = ch.total_msat - ch.to_us_msat;
        }
    }

    async fn local_balance(engine: &Engine<MockNode>, scid: &str) -> u64 {
        engine
            .graph()
            .read()
            .await
            .peer_channel(scid)
            .map(|p| p.to_us_msat)
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Test 1: Circular rebalance around the ring
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_circular_moves_100k_in_four_chunks() {
        let (node, engine) = ring_engine().await;
        let summary = engine
            .circular(CircularParams {
                outscid: CL1.to_string(),
                inscid: CL3.to_string(),
                chunk: chunk(100_000, 25_000, 1000),
            })
            .await
            .unwrap();

        assert_eq!(summary.status, SummaryStatus::Success);
        assert_eq!(summary.chunks_attempted, 4);
        assert_eq!(summary.chunks_succeeded, 4);
        assert_eq!(summary.moved_msat, 100_000 * SAT);
        for attempt in &summary.attempts {
            assert!(attempt.fee_msat as u128 * 1_000_000 <= 1000 * attempt.amount_msat as u128);
            let scids: Vec<&str> = attempt.route.iter().map(|c| c.scid.as_str()).collect();
            assert_eq!(scids, vec![CL1, CL2, CL3]);
        }

        assert_eq!(local_balance(&engine, CL1).await, 900_000 * SAT);
        assert_eq!(local_balance(&engine, CL3).await, 100_000 * SAT);
        // The node itself also paid the routing fees out of cl1
        assert_eq!(node.to_us_msat(CL3), 100_000 * SAT);
        assert_eq!(
            node.to_us_msat(CL1),
            900_000 * SAT - summary.fee_msat
        );
    }

    // -----------------------------------------------------------------------
    // Test 2: Pull after circular picks cl1 and repeats the delta
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_pull_selects_cl1() {
        let (_node, engine) = ring_engine().await;
        engine
            .circular(CircularParams {
                outscid: CL1.to_string(),
                inscid: CL3.to_string(),
                chunk: chunk(100_000, 25_000, 1000),
            })
            .await
            .unwrap();

        let summary = engine
            .circular_pull(PullParams {
                inscid: CL3.to_string(),
                maxoutppm: Some(1000),
                outlist: None,
                depleteuptopercent: None,
                depleteuptoamount: None,
                chunk: chunk(100_000, 25_000, 1000),
            })
            .await
            .unwrap();

        assert_eq!(summary.status, SummaryStatus::Success);
        assert!(summary
            .attempts
            .iter()
            .all(|a| a.out_scid.as_deref() == Some(CL1) && a.in_scid.as_deref() == Some(CL3)));
        assert_eq!(local_balance(&engine, CL1).await, 800_000 * SAT);
        assert_eq!(local_balance(&engine, CL3).await, 200_000 * SAT);
    }

    // -----------------------------------------------------------------------
    // Test 3: Push out of cl1 lands on cl3
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_push_fills_cl3() {
        let (_node, engine) = ring_engine().await;
        let summary = engine
            .circular_push(PushParams {
                outscid: CL1.to_string(),
                minoutppm: None,
                inlist: None,
                filluptopercent: None,
                filluptoamount: None,
                chunk: chunk(50_000, 25_000, 1000),
            })
            .await
            .unwrap();

        assert_eq!(summary.status, SummaryStatus::Success);
        assert_eq!(summary.attempts[0].in_scid.as_deref(), Some(CL3));
        assert_eq!(local_balance(&engine, CL3).await, 50_000 * SAT);
    }

    // -----------------------------------------------------------------------
    // Test 4: A chunk above max_htlc is never truncated
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_chunk_above_max_htlc() {
        let (node, engine) = ring_engine().await;
        let summary = engine
            .circular(CircularParams {
                outscid: CL1.to_string(),
                inscid: CL3.to_string(),
                chunk: chunk(995_000, 995_000, 1000),
            })
            .await
            .unwrap();

        assert_eq!(summary.status, SummaryStatus::Failure);
        assert_eq!(summary.moved_msat, 0);
        assert_eq!(
            summary.attempts[0].error.as_ref().unwrap().kind,
            "no_route_found"
        );
        assert!(node.send_pay_calls.lock().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 5: Total local balance is conserved by the estimates
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_local_balance_conserved() {
        let (_node, engine) = ring_engine().await;
        let before = local_balance(&engine, CL1).await + local_balance(&engine, CL3).await;
        engine
            .circular(CircularParams {
                outscid: CL1.to_string(),
                inscid: CL3.to_string(),
                chunk: chunk(60_000, 25_000, 1000),
            })
            .await
            .unwrap();
        let after = local_balance(&engine, CL1).await + local_balance(&engine, CL3).await;
        assert_eq!(before, after);
    }

    // -----------------------------------------------------------------------
    // Test 6: Refresh idempotence and graph stats
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_refresh_idempotent() {
        let (_node, engine) = ring_engine().await;
        let first = engine.refresh_full().await.unwrap();
        let second = engine.refresh_full().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.nodes, 3);
        assert_eq!(first.channels, 6);
        assert_eq!(first.active_channels, 6);
        assert!(first.channels >= first.active_channels);
    }

    // -----------------------------------------------------------------------
    // Test 7: One-shot commands render JSON
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_commands_render_json() {
        let (_node, engine) = ring_engine().await;

        let out = run_command(&engine, cl1_to_cl3(chunk(25_000, 25_000, 1000)))
            .await
            .unwrap();
        let summary: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(summary["status"], "success");
        assert_eq!(summary["mode"], "circular");
        assert_eq!(summary["moved_msat"], 25_000 * SAT);

        let out = run_command(&engine, Commands::CircularStats).await.unwrap();
        let stats: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(stats["graph_stats"]["nodes"], 3);
        assert_eq!(stats["graph_stats"]["channels"], 6);
        assert_eq!(stats["successes"].as_array().unwrap().len(), 1);
        assert!(stats["failures"].as_array().unwrap().is_empty());

        let out = run_command(&engine, Commands::CircularDeleteStats).await.unwrap();
        let deleted: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(deleted["successes"], 1);
        assert_eq!(deleted["failures"], 0);
    }

    // -----------------------------------------------------------------------
    // Test 8: A temporary failure without an erring channel is retried
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_failure_retried_with_fresh_lookup() {
        let (node, engine) = ring_engine().await;
        node.script(PaymentOutcome::Failed(PaymentFailure {
            code: 204,
            message: "failed: WIRE_TEMPORARY_NODE_FAILURE".to_string(),
            failcodename: Some("WIRE_TEMPORARY_NODE_FAILURE".to_string()),
            ..Default::default()
        }));

        let mut params = chunk(25_000, 25_000, 1000);
        params.attempts = Some(2);
        let summary = engine
            .circular(CircularParams {
                outscid: CL1.to_string(),
                inscid: CL3.to_string(),
                chunk: params,
            })
            .await
            .unwrap();

        assert_eq!(summary.status, SummaryStatus::Success);
        assert_eq!(summary.attempts[0].tries, 2);
        assert_eq!(node.send_pay_calls.lock().unwrap().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 9: A timed-out chunk is recorded and not retried
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_ring_timeout_not_retried() {
        let (node, engine) = ring_engine().await;
        node.script(PaymentOutcome::TimedOut);

        let mut params = chunk(25_000, 25_000, 1000);
        params.attempts = Some(3);
        let summary = engine
            .circular(CircularParams {
                outscid: CL1.to_string(),
                inscid: CL3.to_string(),
                chunk: params,
            })
            .await
            .unwrap();

        assert_eq!(summary.status, SummaryStatus::Failure);
        assert_eq!(summary.attempts[0].tries, 1);
        assert_eq!(node.send_pay_calls.lock().unwrap().len(), 1);
        assert_eq!(engine.stats().await.failures.len(), 1);
        // Nothing moved in the estimates
        assert_eq!(local_balance(&engine, CL1).await, 1_000_000 * SAT);
    }

    // -----------------------------------------------------------------------
    // Test 10: Two requests and a peer refresh running at once
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_concurrent_requests_and_peer_refresh() {
        let (node, engine) = ring_engine().await;
        let request = || CircularParams {
            outscid: CL1.to_string(),
            inscid: CL3.to_string(),
            chunk: chunk(100_000, 25_000, 1000),
        };

        let (a, b, refreshed) = tokio::join!(
            engine.circular(request()),
            engine.circular(request()),
            engine.refresh_peer_liquidity(),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        refreshed.unwrap();

        for summary in [&a, &b] {
            assert_eq!(summary.status, SummaryStatus::Success);
            assert_eq!(summary.moved_msat, 100_000 * SAT);
            assert_eq!(summary.chunks_succeeded, 4);
        }
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(node.send_pay_calls.lock().unwrap().len(), 8);

        // Whatever the interleaving, both halves of an own channel add up
        {
            let graph = engine.graph().read().await;
            for scid in [CL1, CL3] {
                let out = graph.out_half(scid).unwrap();
                let inn = graph.in_half(scid).unwrap();
                assert_eq!(out.liquidity_msat + inn.liquidity_msat, 1_000_000 * SAT);
            }
        }

        let fees = a.fee_msat + b.fee_msat;
        engine.refresh_peer_liquidity().await.unwrap();
        assert_eq!(local_balance(&engine, CL1).await, 800_000 * SAT - fees);
        assert_eq!(local_balance(&engine, CL3).await, 200_000 * SAT);
        assert_eq!(node.to_us_msat(CL1), 800_000 * SAT - fees);
        assert_eq!(node.to_us_msat(CL3), 200_000 * SAT);
    }

    // -----------------------------------------------------------------------
    // Test 11: A reader holding the graph never sees a refresh half applied
    // -----------------------------------------------------------------------
    #[tokio::test(start_paused = true)]
    async fn test_reader_never_sees_half_applied_refresh() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let (node, engine) = ring_engine().await;
        set_local_balance(&node, CL1, 700_000);
        set_local_balance(&node, CL3, 300_000);
        node.channels.lock().unwrap().extend(gossip_pair(
            "104x1x0",
            &node_id('b'),
            &node_id('d'),
            500_000,
            1000,
            10,
        ));

        let guard = engine.graph().read().await;
        let calls = node.list_channels_calls.load(Ordering::SeqCst);
        let refresh = engine.refresh_full();
        tokio::pin!(refresh);

        // Fetched, then parked on the write lock
        let parked = tokio::time::timeout(Duration::from_secs(5), refresh.as_mut()).await;
        assert!(parked.is_err());
        assert_eq!(node.list_channels_calls.load(Ordering::SeqCst), calls + 1);
        assert_eq!(guard.stats().channels, 6);
        assert_eq!(guard.peer_channel(CL1).unwrap().to_us_msat, 1_000_000 * SAT);
        assert_eq!(guard.peer_channel(CL3).unwrap().to_us_msat, 0);
        drop(guard);

        let stats = refresh.await.unwrap();
        assert_eq!(stats.channels, 8);
        assert_eq!(local_balance(&engine, CL1).await, 700_000 * SAT);
        assert_eq!(local_balance(&engine, CL3).await, 300_000 * SAT);
    }
}
