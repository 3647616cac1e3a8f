//! Chunked execution of a rebalance request.
//!
//! Each chunk is an independent self-payment over a route found on a fresh
//! graph snapshot:
//! - Create a self-invoice for the chunk
//! - `sendpay` the route, then `waitsendpay` with the payment timeout
//! - On success, move the chunk between the two own channels in the graph
//! - On a temporary failure, learn from the erring hop and look up again
//!
//! A timed-out chunk is never retried, since its HTLC may still resolve. Its
//! invoice is deleted instead, so a late HTLC is rejected at our own node;
//! if the deletion finds the invoice paid, the chunk counts as moved.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use super::finder::{self, PullFilter, PushFilter};
use super::request::{RebalanceRequest, Target};
use super::result::{RebalanceAttempt, RebalanceSummary};
use crate::client::{InvoiceCancel, NodeClient, PaymentFailure, PaymentOutcome};
use crate::error::{RebalanceError, RebalanceResult};
use crate::graph::{Route, SharedGraph};
use crate::tracker::ledger::PaymentState;
use crate::tracker::StatsTracker;

const INVOICE_DESCRIPTION: &str = "circular rebalance";

/// How one payment try ended, short of success.
enum TryFailure {
    /// The node reported a typed failure; another route may work.
    Failed(PaymentFailure),
    /// We stopped waiting; the payment may still resolve.
    TimedOut(String),
    /// The payment never left (invoice or sendpay refused).
    NotSent(String),
}

pub struct Executor<C: NodeClient> {
    client: Arc<C>,
    graph: SharedGraph,
    tracker: Arc<StatsTracker>,
    payment_timeout_secs: u64,
}

impl<C: NodeClient> Executor<C> {
    pub fn new(
        client: Arc<C>,
        graph: SharedGraph,
        tracker: Arc<StatsTracker>,
        payment_timeout_secs: u64,
    ) -> Self {
        Self {
            client,
            graph,
            tracker,
            payment_timeout_secs,
        }
    }

    /// Run every chunk of `request` in order. Always returns a summary; chunk
    /// failures are recorded rather than propagated.
    pub async fn execute(&self, request: &RebalanceRequest) -> RebalanceSummary {
        let started = Instant::now();
        let chunks = request.chunks();
        info!(
            "Rebalance: {} request {} for {} msat in {} chunks (maxppm {})",
            request.mode().as_str(),
            request.id,
            request.amount_msat,
            chunks.len(),
            request.max_ppm
        );

        let mut attempts = Vec::with_capacity(chunks.len());
        for (index, amount_msat) in chunks.into_iter().enumerate() {
            let attempt = self.run_chunk(request, index, amount_msat).await;
            self.tracker.record(attempt.clone()).await;
            attempts.push(attempt);
        }

        let summary = RebalanceSummary::from_attempts(request, attempts, started.elapsed());
        info!(
            "Rebalance: request {} finished: moved {}/{} msat in {}/{} chunks, fee {} msat ({} ppm)",
            summary.request_id,
            summary.moved_msat,
            summary.target_msat,
            summary.chunks_succeeded,
            summary.chunks_attempted,
            summary.fee_msat,
            summary.fee_ppm
        );
        summary
    }

    async fn run_chunk(
        &self,
        request: &RebalanceRequest,
        index: usize,
        amount_msat: u64,
    ) -> RebalanceAttempt {
        let mut last_route: Option<Route> = None;
        let mut tries: u32 = 0;

        loop {
            tries += 1;
            let route = match self.lookup(request, amount_msat).await {
                Ok(route) => route,
                Err(e) => {
                    warn!("Rebalance: chunk {} of {}: {}", index, request.id, e);
                    return RebalanceAttempt::failed(
                        request,
                        index,
                        amount_msat,
                        last_route.as_ref(),
                        tries,
                        &e,
                    );
                }
            };

            if !route.within_ppm(request.max_ppm) {
                let e = RebalanceError::FeeExceeded {
                    fee_ppm: ceil_ppm(route.fee_msat(), route.amount_msat),
                    max_ppm: request.max_ppm,
                };
                warn!("Rebalance: chunk {} of {}: {}", index, request.id, e);
                return RebalanceAttempt::failed(request, index, amount_msat, Some(&route), tries, &e);
            }

            debug!(
                "Rebalance: chunk {} try {} over {} (fee {} msat)",
                index,
                tries,
                route.describe(),
                route.fee_msat()
            );
            let label = format!("circular-{}-{}-{}", request.id, index, tries);
            let failure = match self.pay(&route, &label).await {
                Ok(fee_msat) => {
                    info!(
                        "Rebalance: chunk {} of {} moved {} msat {} -> {}, fee {} msat",
                        index,
                        request.id,
                        route.amount_msat,
                        route.out_scid().unwrap_or("?"),
                        route.in_scid().unwrap_or("?"),
                        fee_msat
                    );
                    return RebalanceAttempt::succeeded(request, index, &route, fee_msat, tries);
                }
                Err(failure) => failure,
            };

            let (err, retry) = match failure {
                TryFailure::Failed(f) => {
                    self.learn(&route, &f).await;
                    (RebalanceError::PaymentFailed(f.reason()), f.is_temporary())
                }
                TryFailure::NotSent(reason) => (RebalanceError::PaymentFailed(reason), true),
                TryFailure::TimedOut(reason) => (RebalanceError::PaymentFailed(reason), false),
            };
            if retry && tries < request.attempts {
                debug!(
                    "Rebalance: chunk {} try {} failed ({}), looking up another route",
                    index, tries, err
                );
                last_route = Some(route);
                continue;
            }

            warn!("Rebalance: chunk {} of {}: {}", index, request.id, err);
            return RebalanceAttempt::failed(request, index, amount_msat, Some(&route), tries, &err);
        }
    }

    /// Cheapest route for the chunk on the current graph snapshot.
    async fn lookup(&self, request: &RebalanceRequest, amount_msat: u64) -> RebalanceResult<Route> {
        let graph = self.graph.read().await;
        match &request.target {
            Target::Circular { out_scid, in_scid } => {
                finder::circular_route(&graph, out_scid, in_scid, amount_msat, request.max_hops)
            }
            Target::Pull {
                in_scid,
                max_out_ppm,
                out_list,
                deplete_percent,
                deplete_amount_msat,
            } => {
                let filter = PullFilter {
                    max_out_ppm: *max_out_ppm,
                    out_list: out_list.as_deref(),
                    deplete_percent: *deplete_percent,
                    deplete_amount_msat: *deplete_amount_msat,
                };
                let candidates =
                    finder::pull_candidates(&graph, in_scid, amount_msat, request.max_hops, &filter)?;
                first_route(candidates, amount_msat)
            }
            Target::Push {
                out_scid,
                min_out_ppm,
                in_list,
                fill_percent,
                fill_amount_msat,
            } => {
                let filter = PushFilter {
                    min_out_ppm: *min_out_ppm,
                    in_list: in_list.as_deref(),
                    fill_percent: *fill_percent,
                    fill_amount_msat: *fill_amount_msat,
                };
                let candidates =
                    finder::push_candidates(&graph, out_scid, amount_msat, request.max_hops, &filter)?;
                first_route(candidates, amount_msat)
            }
        }
    }

    /// Pay `route` to ourselves. Returns the fee actually paid.
    async fn pay(&self, route: &Route, label: &str) -> Result<u64, TryFailure> {
        let invoice = self
            .client
            .create_invoice(route.amount_msat, label, INVOICE_DESCRIPTION)
            .await
            .map_err(|e| TryFailure::NotSent(format!("{:#}", e)))?;

        let ledger = self.tracker.ledger();
        ledger.issue(&invoice.payment_hash, route).await;

        if let Err(e) = self
            .client
            .send_pay(&route.to_sendpay(), &invoice.payment_hash, &invoice.payment_secret)
            .await
        {
            ledger.resolve(&invoice.payment_hash, PaymentState::Failed).await;
            return Err(TryFailure::NotSent(format!("{:#}", e)));
        }

        let outcome = self
            .client
            .wait_send_pay(&invoice.payment_hash, self.payment_timeout_secs)
            .await;
        match outcome {
            Ok(PaymentOutcome::Complete {
                amount_msat,
                amount_sent_msat,
            }) => {
                ledger
                    .resolve(&invoice.payment_hash, PaymentState::Succeeded)
                    .await;
                Ok(self
                    .book_success(route, amount_sent_msat.saturating_sub(amount_msat))
                    .await)
            }
            Ok(PaymentOutcome::Failed(failure)) => {
                ledger.resolve(&invoice.payment_hash, PaymentState::Failed).await;
                Err(TryFailure::Failed(failure))
            }
            Ok(PaymentOutcome::TimedOut) => {
                let reason = format!(
                    "timed out after {}s waiting for {}",
                    self.payment_timeout_secs, invoice.payment_hash
                );
                self.give_up(route, label, &invoice.payment_hash, reason).await
            }
            // The HTLC may be in flight; treat like a timeout.
            Err(e) => {
                let reason = format!("timed out waiting for {}: {:#}", invoice.payment_hash, e);
                self.give_up(route, label, &invoice.payment_hash, reason).await
            }
        }
    }

    /// Stop waiting for a payment. Deleting the unpaid invoice makes a late
    /// HTLC fail at our node; an invoice that turns out paid is a success.
    async fn give_up(
        &self,
        route: &Route,
        label: &str,
        payment_hash: &str,
        reason: String,
    ) -> Result<u64, TryFailure> {
        let ledger = self.tracker.ledger();
        match self.client.delete_invoice(label).await {
            Ok(InvoiceCancel::AlreadyPaid) => {
                info!(
                    "Rebalance: {} settled after we stopped waiting ({})",
                    payment_hash, reason
                );
                ledger.resolve(payment_hash, PaymentState::Succeeded).await;
                // sendpay carried exactly the route's amounts
                Ok(self.book_success(route, route.fee_msat()).await)
            }
            Ok(InvoiceCancel::Deleted) => {
                debug!("Rebalance: deleted invoice {}", label);
                ledger.resolve(payment_hash, PaymentState::TimedOut).await;
                Err(TryFailure::TimedOut(reason))
            }
            Err(e) => {
                warn!("Rebalance: could not delete invoice {}: {:#}", label, e);
                ledger.resolve(payment_hash, PaymentState::TimedOut).await;
                Err(TryFailure::TimedOut(reason))
            }
        }
    }

    async fn book_success(&self, route: &Route, fee_msat: u64) -> u64 {
        self.graph
            .apply_payment_result(route, route.amount_msat, fee_msat)
            .await;
        self.tracker.record_cost(route, fee_msat).await;
        fee_msat
    }

    /// Feed a typed failure into the liquidity estimates.
    pub async fn learn(&self, route: &Route, failure: &PaymentFailure) {
        let Some(scid) = failure.erring_channel.as_deref() else {
            return;
        };
        // Our own node refusing the HTLC (deleted invoice) says nothing
        // about channel liquidity.
        let destination = route.hops.last().map(|h| h.destination.as_str());
        if failure.erring_node.is_some() && failure.erring_node.as_deref() == destination {
            debug!("Rebalance: failure reported by the final node, nothing to learn");
            return;
        }
        let hop = route.hops.iter().find(|h| {
            h.channel.scid == scid && failure.erring_direction.map_or(true, |d| d == h.channel.direction)
        });
        let Some(hop) = hop else {
            debug!("Rebalance: erring channel {} is not on the route", scid);
            return;
        };
        let learned = self
            .graph
            .apply_payment_failure(&hop.channel.scid, hop.channel.direction, hop.amount_msat)
            .await;
        if learned {
            debug!(
                "Rebalance: {} could not forward {} msat",
                hop.channel, hop.amount_msat
            );
        }
    }
}

fn first_route(candidates: Vec<finder::Candidate>, amount_msat: u64) -> RebalanceResult<Route> {
    candidates
        .into_iter()
        .next()
        .map(|c| c.route)
        .ok_or_else(|| RebalanceError::NoRouteFound(format!("no candidate for {} msat", amount_msat)))
}

/// Fee rate rounded up, so a route just above the ceiling never reports it.
fn ceil_ppm(fee_msat: u64, amount_msat: u64) -> u64 {
    if amount_msat == 0 {
        return 0;
    }
    let amount = amount_msat as u128;
    ((fee_msat as u128 * 1_000_000 + amount - 1) / amount) as u64
}
