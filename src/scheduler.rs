use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::client::NodeClient;
use crate::config::EngineConfig;
use crate::engine::Engine;

/// Periodic graph, peer and stats-log tasks, each on its own timer. The peer
/// task also follows up on payments that timed out.
pub struct RefreshScheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Graph,
    Peers,
    StatsLog,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Graph => "graph refresh",
            Job::Peers => "peer refresh",
            Job::StatsLog => "stats log",
        }
    }
}

impl RefreshScheduler {
    /// Spawn the timers. The first tick of each fires one period from now;
    /// callers do the initial refresh themselves.
    pub fn start<C: NodeClient + 'static>(engine: Arc<Engine<C>>, config: &EngineConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let jobs = [
            (Job::Graph, config.graph_refresh_secs),
            (Job::Peers, config.peer_refresh_secs),
            (Job::StatsLog, config.stats_log_interval_secs),
        ];
        let handles = jobs
            .into_iter()
            .map(|(job, secs)| {
                let period = Duration::from_secs(secs.max(1));
                tokio::spawn(run_job(engine.clone(), job, period, rx.clone()))
            })
            .collect();
        info!(
            "Scheduler: graph every {}s, peers every {}s",
            config.graph_refresh_secs, config.peer_refresh_secs
        );
        Self { shutdown, handles }
    }

    /// Flip the shutdown watch and wait for every task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Scheduler: task ended abnormally: {}", e);
            }
        }
        debug!("Scheduler: stopped");
    }
}

async fn run_job<C: NodeClient + 'static>(
    engine: Arc<Engine<C>>,
    job: Job,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match job {
            Job::Graph => match engine.refresh_full().await {
                Ok(stats) => debug!(
                    "Scheduler: graph refreshed ({} nodes, {} channels)",
                    stats.nodes, stats.channels
                ),
                Err(e) => warn!("Scheduler: {} failed: {}", job.name(), e),
            },
            Job::Peers => {
                if let Err(e) = engine.refresh_peer_liquidity().await {
                    warn!("Scheduler: {} failed: {}", job.name(), e);
                }
                let resolved = engine.reconcile_timed_out().await;
                if resolved > 0 {
                    debug!("Scheduler: resolved {} timed-out payments", resolved);
                }
            }
            Job::StatsLog => {
                let report = engine.stats().await;
                let g = report.graph_stats;
                info!(
                    "Scheduler: graph {} nodes, {}/{} channels active, {} liquid, {} max-htlc; {} successes, {} failures",
                    g.nodes,
                    g.active_channels,
                    g.channels,
                    g.liquid_channels,
                    g.max_htlc_channels,
                    report.successes.len(),
                    report.failures.len()
                );
            }
        }
    }
    debug!("Scheduler: {} task exiting", job.name());
}
