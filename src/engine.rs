use log::{debug, info, warn};
use std::sync::Arc;

use crate::client::{NodeClient, PaymentFailure, PaymentOutcome};
use crate::config::{Config, DefaultsConfig};
use crate::db::Database;
use crate::error::RebalanceResult;
use crate::graph::{store, ChannelGraph, GraphStats, SharedGraph};
use crate::rebalance::finder;
use crate::rebalance::request::{CircularParams, NodeParams, PullParams, PushParams};
use crate::rebalance::{Executor, RebalanceRequest, RebalanceSummary};
use crate::tracker::ledger::PaymentState;
use crate::tracker::{DeletedStats, StatsReport, StatsTracker};

/// `waitsendpay` timeout when asking after a payment we gave up on.
const LATE_RESULT_WAIT_SECS: u64 = 1;

/// Everything an operator command touches: the node, the shared graph and
/// the attempt history.
pub struct Engine<C: NodeClient> {
    client: Arc<C>,
    graph: SharedGraph,
    tracker: Arc<StatsTracker>,
    executor: Executor<C>,
    defaults: DefaultsConfig,
}

impl<C: NodeClient> Engine<C> {
    /// Identify the local node and restore the last saved graph for it.
    pub async fn start(client: Arc<C>, config: &Config, db: Database) -> anyhow::Result<Self> {
        let info = client.get_info().await?;
        info!("Engine: connected to node {} ({})", info.id, info.alias);

        let mut graph = ChannelGraph::new(&info.id);
        match store::load(&db, &mut graph) {
            Ok(0) => {}
            Ok(n) => info!("Engine: restored {} channel halves from the database", n),
            Err(e) => warn!("Engine: starting with an empty graph: {:#}", e),
        }
        let graph = SharedGraph::new(graph, config.engine.liquidity_reset_secs);
        let tracker = Arc::new(StatsTracker::new(
            db,
            config.engine.max_stored_attempts,
            config.engine.stats_retention_days,
        )?);
        let executor = Executor::new(
            client.clone(),
            graph.clone(),
            tracker.clone(),
            config.engine.payment_timeout_secs,
        );

        Ok(Self {
            client,
            graph,
            tracker,
            executor,
            defaults: config.defaults.clone(),
        })
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn tracker(&self) -> &StatsTracker {
        &self.tracker
    }

    pub async fn refresh_full(&self) -> RebalanceResult<GraphStats> {
        let stats = self.graph.refresh_full(self.client.as_ref()).await?;
        self.save_graph().await;
        Ok(stats)
    }

    pub async fn refresh_peer_liquidity(&self) -> RebalanceResult<()> {
        self.graph.refresh_peer_liquidity(self.client.as_ref()).await
    }

    pub async fn circular(&self, params: CircularParams) -> RebalanceResult<RebalanceSummary> {
        let request = params.into_request(&self.defaults)?;
        Ok(self.run(request).await)
    }

    pub async fn circular_pull(&self, params: PullParams) -> RebalanceResult<RebalanceSummary> {
        let request = params.into_request(&self.defaults)?;
        Ok(self.run(request).await)
    }

    pub async fn circular_push(&self, params: PushParams) -> RebalanceResult<RebalanceSummary> {
        let request = params.into_request(&self.defaults)?;
        Ok(self.run(request).await)
    }

    /// Circular rebalance between two peers, each given by id or alias.
    pub async fn circular_node(&self, params: NodeParams) -> RebalanceResult<RebalanceSummary> {
        let (out_scid, in_scid) = {
            let graph = self.graph.read().await;
            finder::resolve_node_channels(&graph, &params.outnode, &params.innode)?
        };
        debug!(
            "Engine: {} -> {} resolved to {} -> {}",
            params.outnode, params.innode, out_scid, in_scid
        );
        self.circular(params.into_circular(out_scid, in_scid)).await
    }

    async fn run(&self, request: RebalanceRequest) -> RebalanceSummary {
        let summary = self.executor.execute(&request).await;
        self.save_graph().await;
        summary
    }

    /// Write the graph snapshot the next start restores. Failures are
    /// logged only.
    pub async fn save_graph(&self) {
        let graph = self.graph.read().await;
        let db = self.tracker.database().lock().await;
        match store::save(&db, &graph) {
            Ok(n) => debug!("Engine: saved {} channel halves", n),
            Err(e) => warn!("Engine: failed to save the graph: {:#}", e),
        }
    }

    /// Live graph aggregates, the recorded attempts and own-channel costs.
    pub async fn stats(&self) -> StatsReport {
        let (graph_stats, own_scids) = {
            let graph = self.graph.read().await;
            let mut scids: Vec<String> = graph
                .peer_channels()
                .filter_map(|p| p.short_channel_id.clone())
                .collect();
            scids.sort();
            (graph.stats(), scids)
        };
        self.tracker.report(graph_stats, &own_scids).await
    }

    pub async fn delete_stats(&self) -> anyhow::Result<DeletedStats> {
        let deleted = self.tracker.delete_stats().await?;
        info!(
            "Engine: deleted {} successes, {} failures, {} cost rows",
            deleted.successes, deleted.failures, deleted.costs
        );
        Ok(deleted)
    }

    /// Out-of-band failure notification for a payment the engine sent.
    /// Duplicates, settled payments and foreign hashes are ignored. Returns
    /// whether the notification was used.
    pub async fn notify_payment_failure(&self, payment_hash: &str, failure: &PaymentFailure) -> bool {
        match self.tracker.ledger().accept_failure(payment_hash).await {
            Some(route) => {
                debug!(
                    "Engine: late failure for {}: {}",
                    payment_hash,
                    failure.reason()
                );
                self.executor.learn(&route, failure).await;
                self.save_graph().await;
                true
            }
            None => {
                debug!("Engine: ignoring failure notification for {}", payment_hash);
                false
            }
        }
    }

    /// Ask the node how the payments we stopped waiting for ended. Late
    /// failures go through `notify_payment_failure`. Returns how many
    /// payments were resolved.
    pub async fn reconcile_timed_out(&self) -> usize {
        let ledger = self.tracker.ledger();
        let mut resolved = 0;
        for hash in ledger.timed_out().await {
            match self.client.wait_send_pay(&hash, LATE_RESULT_WAIT_SECS).await {
                Ok(PaymentOutcome::Failed(failure)) => {
                    if self.notify_payment_failure(&hash, &failure).await {
                        resolved += 1;
                    }
                }
                Ok(PaymentOutcome::Complete { amount_msat, .. }) => {
                    // Only possible when the invoice could not be deleted;
                    // the peer refresh carries the new balances.
                    warn!(
                        "Engine: payment {} settled {} msat after it was given up",
                        hash, amount_msat
                    );
                    ledger.resolve(&hash, PaymentState::Succeeded).await;
                    resolved += 1;
                }
                Ok(PaymentOutcome::TimedOut) => debug!("Engine: {} still in flight", hash),
                Err(e) => debug!("Engine: could not look up {}: {:#}", hash, e),
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{node_id, MockNode, SAT};
    use crate::client::PaymentOutcome;
    use crate::graph::ChannelId;
    use crate::rebalance::request::ChunkParams;
    use crate::rebalance::SummaryStatus;

    async fn engine(node: MockNode) -> (Arc<MockNode>, Engine<MockNode>) {
        let node = Arc::new(node);
        let config = Config::test_default(std::path::PathBuf::from("/dev/null"));
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

    fn cl2_failure() -> PaymentFailure {
        PaymentFailure {
            code: 204,
            message: "failed: WIRE_TEMPORARY_CHANNEL_FAILURE".to_string(),
            failcodename: Some("WIRE_TEMPORARY_CHANNEL_FAILURE".to_string()),
            erring_node: Some(node_id('b')),
            erring_channel: Some("102x1x0".to_string()),
            erring_direction: Some(0),
        }
    }

    #[tokio::test]
    async fn test_invalid_request_runs_no_chunk() {
        let (node, engine) = engine(MockNode::ring()).await;
        let err = engine
            .circular(CircularParams {
                outscid: "101x1x0".to_string(),
                inscid: "103x1x0".to_string(),
                chunk: chunk(10_000, 25_000, 1000),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(node.send_pay_calls.lock().unwrap().is_empty());
        assert!(engine.stats().await.failures.is_empty());
    }

    #[tokio::test]
    async fn test_circular_node_by_alias() {
        let (node, engine) = engine(MockNode::ring()).await;
        let summary = engine
            .circular_node(NodeParams {
                outnode: "bob".to_string(),
                innode: "carol".to_string(),
                chunk: chunk(25_000, 25_000, 1000),
            })
            .await
            .unwrap();
        assert_eq!(summary.status, SummaryStatus::Success);
        assert_eq!(node.to_us_msat("103x1x0"), 25_000 * SAT);
    }

    #[tokio::test]
    async fn test_late_failure_after_timeout_feeds_learning_once() {
        let (node, engine) = engine(MockNode::ring()).await;
        node.script(PaymentOutcome::TimedOut);
        let summary = engine
            .circular(CircularParams {
                outscid: "101x1x0".to_string(),
                inscid: "103x1x0".to_string(),
                chunk: chunk(25_000, 25_000, 1000),
            })
            .await
            .unwrap();
        assert_eq!(summary.status, SummaryStatus::Failure);

        let hash = format!("{:064x}", 1);
        assert!(engine.notify_payment_failure(&hash, &cl2_failure()).await);
        assert!(!engine.notify_payment_failure(&hash, &cl2_failure()).await);
        assert!(!engine.notify_payment_failure("feed", &cl2_failure()).await);

        let graph = engine.graph().read().await;
        let half = graph.channel(&ChannelId::new("102x1x0", 0)).unwrap();
        assert_eq!(half.liquidity_msat, 24_001_250);
    }

    #[tokio::test]
    async fn test_stats_and_delete() {
        let (_node, engine) = engine(MockNode::ring()).await;
        engine
            .circular(CircularParams {
                outscid: "101x1x0".to_string(),
                inscid: "103x1x0".to_string(),
                chunk: chunk(50_000, 25_000, 1000),
            })
            .await
            .unwrap();

        let report = engine.stats().await;
        assert_eq!(report.graph_stats.nodes, 3);
        assert_eq!(report.graph_stats.channels, 6);
        assert_eq!(report.successes.len(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(report.channel_costs["103x1x0"].fee_spent_msat, 5000);
        assert_eq!(report.channel_costs["103x1x0"].amount_in_msat, 50_000 * SAT as i64);
        assert_eq!(report.channel_costs["101x1x0"].amount_out_msat, 50_000 * SAT as i64);

        let deleted = engine.delete_stats().await.unwrap();
        assert_eq!(deleted.successes, 2);
        assert_eq!(deleted.costs, 2);
        let report = engine.stats().await;
        assert!(report.successes.is_empty());
        assert!(report.channel_costs.is_empty());
    }

    #[tokio::test]
    async fn test_stats_follow_refreshes_only() {
        let (node, engine) = engine(MockNode::ring()).await;
        let before = engine.stats().await.graph_stats;

        // A peer going away shows up only once the graph is refreshed
        node.peer_channels.lock().unwrap()[0].peer_connected = false;
        assert_eq!(engine.stats().await.graph_stats, before);
        engine.refresh_peer_liquidity().await.unwrap();
        let after = engine.stats().await.graph_stats;
        assert_eq!(after.active_channels, before.active_channels - 2);
    }

    #[tokio::test]
    async fn test_learned_liquidity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circular.db");
        let config = Config::test_default(std::path::PathBuf::from("/dev/null"));
        let cl2 = ChannelId::new("102x1x0", 0);

        let node = Arc::new(MockNode::ring());
        {
            let engine = Engine::start(node.clone(), &config, Database::open(&path).unwrap())
                .await
                .unwrap();
            engine.refresh_full().await.unwrap();
            node.script(PaymentOutcome::Failed(cl2_failure()));
            engine
                .circular(CircularParams {
                    outscid: "101x1x0".to_string(),
                    inscid: "103x1x0".to_string(),
                    chunk: chunk(25_000, 25_000, 1000),
                })
                .await
                .unwrap();
            assert_eq!(
                engine.graph().read().await.channel(&cl2).unwrap().liquidity_msat,
                24_001_250
            );
        }

        let engine = Engine::start(node.clone(), &config, Database::open(&path).unwrap())
            .await
            .unwrap();
        assert_eq!(
            engine.graph().read().await.channel(&cl2).unwrap().liquidity_msat,
            24_001_250
        );
        engine.refresh_full().await.unwrap();
        assert_eq!(
            engine.graph().read().await.channel(&cl2).unwrap().liquidity_msat,
            24_001_250
        );
    }

    #[tokio::test]
    async fn test_reconcile_learns_from_late_failure() {
        let (node, engine) = engine(MockNode::ring()).await;
        node.script(PaymentOutcome::TimedOut);
        engine
            .circular(CircularParams {
                outscid: "101x1x0".to_string(),
                inscid: "103x1x0".to_string(),
                chunk: chunk(25_000, 25_000, 1000),
            })
            .await
            .unwrap();

        let hash = format!("{:064x}", 1);
        node.resolve_late(&hash, PaymentOutcome::Failed(cl2_failure()));
        assert_eq!(engine.reconcile_timed_out().await, 1);
        assert_eq!(
            engine.tracker().ledger().state(&hash).await,
            Some(PaymentState::Failed)
        );
        let graph = engine.graph().read().await;
        let half = graph.channel(&ChannelId::new("102x1x0", 0)).unwrap();
        assert_eq!(half.liquidity_msat, 24_001_250);
        drop(graph);

        // Nothing left to ask about
        assert_eq!(engine.reconcile_timed_out().await, 0);
    }

    #[tokio::test]
    async fn test_reconcile_skips_payments_still_in_flight() {
        let (node, engine) = engine(MockNode::ring()).await;
        node.script(PaymentOutcome::TimedOut);
        node.script(PaymentOutcome::TimedOut);
        engine
            .circular(CircularParams {
                outscid: "101x1x0".to_string(),
                inscid: "103x1x0".to_string(),
                chunk: chunk(25_000, 25_000, 1000),
            })
            .await
            .unwrap();

        assert_eq!(engine.reconcile_timed_out().await, 0);
        let hash = format!("{:064x}", 1);
        assert_eq!(
            engine.tracker().ledger().state(&hash).await,
            Some(PaymentState::TimedOut)
        );
    }
}
