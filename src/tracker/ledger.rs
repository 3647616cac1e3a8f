use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::graph::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

impl PaymentState {
    /// Whether a late notification can still change what we know.
    fn open(&self) -> bool {
        matches!(self, PaymentState::Pending | PaymentState::TimedOut)
    }
}

struct Entry {
    state: PaymentState,
    route: Route,
}

struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Every payment hash the engine issued, with the route it was sent over.
pub struct PaymentLedger {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl PaymentLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub async fn issue(&self, payment_hash: &str, route: &Route) {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(payment_hash) {
            return;
        }
        inner.entries.insert(
            payment_hash.to_string(),
            Entry {
                state: PaymentState::Pending,
                route: route.clone(),
            },
        );
        inner.order.push_back(payment_hash.to_string());

        // Forget the oldest payments
        while inner.order.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Record how our own wait for the payment ended.
    pub async fn resolve(&self, payment_hash: &str, state: PaymentState) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(payment_hash) {
            if entry.state.open() {
                entry.state = state;
            }
        }
    }

    /// Accept an out-of-band failure notification. Returns the route it was
    /// sent over if the hash is ours and still open, `None` otherwise.
    pub async fn accept_failure(&self, payment_hash: &str) -> Option<Route> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(payment_hash)?;
        if !entry.state.open() {
            return None;
        }
        entry.state = PaymentState::Failed;
        Some(entry.route.clone())
    }

    /// Hashes we stopped waiting for whose outcome is still unknown, oldest first.
    pub async fn timed_out(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter(|h| {
                inner
                    .entries
                    .get(*h)
                    .map_or(false, |e| e.state == PaymentState::TimedOut)
            })
            .cloned()
            .collect()
    }

    pub async fn state(&self, payment_hash: &str) -> Option<PaymentState> {
        self.inner
            .lock()
            .await
            .entries
            .get(payment_hash)
            .map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            hops: Vec::new(),
            amount_msat: 1000,
        }
    }

    #[tokio::test]
    async fn test_duplicate_failure_accepted_once() {
        let ledger = PaymentLedger::new(10);
        ledger.issue("h1", &route()).await;
        assert!(ledger.accept_failure("h1").await.is_some());
        assert!(ledger.accept_failure("h1").await.is_none());
        assert_eq!(ledger.state("h1").await, Some(PaymentState::Failed));
    }

    #[tokio::test]
    async fn test_delayed_failure_after_timeout() {
        let ledger = PaymentLedger::new(10);
        ledger.issue("h1", &route()).await;
        ledger.resolve("h1", PaymentState::TimedOut).await;
        assert!(ledger.accept_failure("h1").await.is_some());
    }

    #[tokio::test]
    async fn test_settled_and_unknown_ignored() {
        let ledger = PaymentLedger::new(10);
        ledger.issue("h1", &route()).await;
        ledger.resolve("h1", PaymentState::Succeeded).await;
        assert!(ledger.accept_failure("h1").await.is_none());
        // A success cannot be overwritten by a late resolve either
        ledger.resolve("h1", PaymentState::Failed).await;
        assert_eq!(ledger.state("h1").await, Some(PaymentState::Succeeded));

        assert!(ledger.accept_failure("not-ours").await.is_none());
    }

    #[tokio::test]
    async fn test_timed_out_lists_only_unresolved_timeouts() {
        let ledger = PaymentLedger::new(10);
        for hash in ["h1", "h2", "h3", "h4"] {
            ledger.issue(hash, &route()).await;
        }
        ledger.resolve("h1", PaymentState::TimedOut).await;
        ledger.resolve("h2", PaymentState::Succeeded).await;
        ledger.resolve("h3", PaymentState::TimedOut).await;
        assert_eq!(ledger.timed_out().await, vec!["h1", "h3"]);

        ledger.accept_failure("h1").await;
        assert_eq!(ledger.timed_out().await, vec!["h3"]);
    }

    #[tokio::test]
    async fn test_bounded() {
        let ledger = PaymentLedger::new(2);
        for hash in ["h1", "h2", "h3"] {
            ledger.issue(hash, &route()).await;
        }
        assert_eq!(ledger.state("h1").await, None);
        assert_eq!(ledger.state("h3").await, Some(PaymentState::Pending));
    }
}
