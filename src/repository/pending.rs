//! Registry of in-flight fetches
//!
//! The first caller for a key becomes the leader and receives a
//! [`PendingTicket`]; every caller arriving before the ticket settles gets a
//! receiver on the same outcome instead of issuing another remote call.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::lock;
use crate::error::{AppError, AppResult};

type Outcome = Option<AppResult<Value>>;

struct PendingEntry {
    id: u64,
    outcome: watch::Receiver<Outcome>,
}

#[derive(Default)]
pub struct PendingRegistry {
    inflight: Mutex<HashMap<String, PendingEntry>>,
    next_id: AtomicU64,
}

/// Result of [`PendingRegistry::claim`]
pub enum Claim {
    /// No request was in flight; the caller must run the fetch and settle the ticket
    Leader(PendingTicket),
    /// A request is already in flight; wait on its outcome
    Follower(watch::Receiver<Outcome>),
}

/// Ownership of one in-flight request
pub struct PendingTicket {
    registry: Arc<PendingRegistry>,
    key: String,
    id: u64,
    outcome: watch::Sender<Outcome>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key` in a single synchronous step
    pub fn claim(self: &Arc<Self>, key: &str) -> Claim {
        let mut inflight = lock(&self.inflight);
        if let Some(entry) = inflight.get(key) {
            return Claim::Follower(entry.outcome.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), PendingEntry { id, outcome: rx });

        Claim::Leader(PendingTicket {
            registry: Arc::clone(self),
            key: key.to_string(),
            id,
            outcome: tx,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inflight).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inflight).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every in-flight request. Their leaders still run to completion
    /// and deliver to the callers already waiting.
    pub fn clear(&self) -> usize {
        let mut inflight = lock(&self.inflight);
        let count = inflight.len();
        inflight.clear();
        count
    }

    /// Forget the in-flight request for `key`: later callers start a new
    /// fetch and the detached one no longer writes its result to the cache
    pub fn detach(&self, key: &str) -> bool {
        lock(&self.inflight).remove(key).is_some()
    }

    pub fn detach_prefix(&self, prefix: &str) -> usize {
        let mut inflight = lock(&self.inflight);
        let before = inflight.len();
        inflight.retain(|key, _| !key.starts_with(prefix));
        before - inflight.len()
    }

    fn remove_if(&self, key: &str, id: u64) {
        let mut inflight = lock(&self.inflight);
        if inflight.get(key).map_or(false, |entry| entry.id == id) {
            inflight.remove(key);
        }
    }

    /// Wait for the outcome behind a receiver obtained from [`claim`](Self::claim)
    pub async fn wait(mut outcome: watch::Receiver<Outcome>) -> AppResult<Value> {
        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AppError::Fetch("request was abandoned before completion".to_string()))?;

        match &*settled {
            Some(result) => result.clone(),
            None => Err(AppError::Fetch("request settled without a result".to_string())),
        }
    }
}

impl PendingTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn subscribe(&self) -> watch::Receiver<Outcome> {
        self.outcome.subscribe()
    }

    /// Remove the registry entry, then hand the result to every waiter
    pub fn settle(self, result: AppResult<Value>) {
        self.registry.remove_if(&self.key, self.id);
        self.outcome.send_replace(Some(result));
    }

    /// Like [`settle`](Self::settle), but a successful value is first passed
    /// to `store` while the registry lock is held, and only if this request
    /// was not detached or cleared meanwhile. Returns whether `store` ran.
    pub fn settle_and_store<F>(self, result: AppResult<Value>, store: F) -> bool
    where
        F: FnOnce(&Value),
    {
        let stored = {
            let mut inflight = lock(&self.registry.inflight);
            let current = inflight
                .get(&self.key)
                .map_or(false, |entry| entry.id == self.id);
            if current {
                inflight.remove(&self.key);
            }
            match &result {
                Ok(value) if current => {
                    store(value);
                    true
                }
                _ => false,
            }
        };
        self.outcome.send_replace(Some(result));
        stored
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        // settle() already removed it; a dropped, unsettled ticket must not block the key
        self.registry.remove_if(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_second_claim_follows_the_first() {
        let registry = Arc::new(PendingRegistry::new());

        let ticket = match registry.claim("books") {
            Claim::Leader(ticket) => ticket,
            Claim::Follower(_) => panic!("first claim must lead"),
        };
        let follower = match registry.claim("books") {
            Claim::Follower(rx) => rx,
            Claim::Leader(_) => panic!("second claim must follow"),
        };
        let leader_rx = ticket.subscribe();

        ticket.settle(Ok(json!(["Dune"])));

        assert!(!registry.contains("books"));
        assert_eq!(PendingRegistry::wait(follower).await, Ok(json!(["Dune"])));
        assert_eq!(PendingRegistry::wait(leader_rx).await, Ok(json!(["Dune"])));
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_key() {
        let registry = Arc::new(PendingRegistry::new());
        let rx = match registry.claim("users") {
            Claim::Leader(ticket) => {
                let rx = ticket.subscribe();
                drop(ticket);
                rx
            }
            Claim::Follower(_) => unreachable!(),
        };

        assert!(registry.is_empty());
        assert!(matches!(PendingRegistry::wait(rx).await, Err(AppError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_detached_ticket_skips_store_but_serves_waiters() {
        let registry = Arc::new(PendingRegistry::new());
        let Claim::Leader(old) = registry.claim("book:7") else {
            panic!("expected leader")
        };
        let waiter = old.subscribe();

        assert!(registry.detach("book:7"));
        let Claim::Leader(fresh) = registry.claim("book:7") else {
            panic!("detached key must get a new leader")
        };

        let mut stored = Vec::new();
        assert!(!old.settle_and_store(Ok(json!(1)), |v| stored.push(v.clone())));
        assert!(stored.is_empty());
        assert_eq!(PendingRegistry::wait(waiter).await, Ok(json!(1)));
        assert!(registry.contains("book:7"));

        assert!(fresh.settle_and_store(Ok(json!(2)), |v| stored.push(v.clone())));
        assert_eq!(stored, vec![json!(2)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_prefix() {
        let registry = Arc::new(PendingRegistry::new());
        let _a = registry.claim("notifications:u1");
        let _b = registry.claim("notifications:u2");
        let _c = registry.claim("dashboard_stats");

        assert_eq!(registry.detach_prefix("notifications:"), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_ticket_does_not_remove_newer_entry() {
        let registry = Arc::new(PendingRegistry::new());
        let Claim::Leader(old) = registry.claim("stats") else {
            panic!("expected leader")
        };
        registry.clear();
        let Claim::Leader(_current) = registry.claim("stats") else {
            panic!("expected leader after clear")
        };

        old.settle(Ok(json!(1)));
        assert!(registry.contains("stats"));
    }
}
