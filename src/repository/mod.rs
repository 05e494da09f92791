//! In-memory synchronization stores
//!
//! The cache, the in-flight request registry and the channel registry must
//! be visible to every consumer in the process, so they are grouped in one
//! [`Repository`] that can be injected, shared through
//! [`Repository::global`], and reset with [`Repository::cleanup`].

pub mod cache;
pub mod channels;
pub mod pending;

use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use cache::{CacheEntry, CacheStore};
pub use channels::ChannelRegistry;
pub use pending::{Claim, PendingRegistry, PendingTicket};

static GLOBAL: Lazy<Repository> = Lazy::new(Repository::new);

/// Lock a store mutex. Every critical section in the stores is a single
/// insert/remove, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Main repository struct holding the process-wide stores
#[derive(Clone, Default)]
pub struct Repository {
    pub cache: Arc<CacheStore>,
    pub pending: Arc<PendingRegistry>,
    pub channels: Arc<ChannelRegistry>,
}

impl Repository {
    /// Create a fresh, empty set of stores
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide stores shared by independently created services
    pub fn global() -> &'static Repository {
        &GLOBAL
    }

    /// Clear all three stores; channels still registered are unsubscribed.
    pub fn cleanup(&self) {
        let cached = self.cache.len();
        self.cache.clear();
        let pending = self.pending.clear();
        let handles = self.channels.clear();
        let channels = handles.len();
        for handle in handles {
            handle.unsubscribe();
        }
        tracing::info!(
            "Synchronization stores cleared: {} cache entries, {} pending requests, {} channels",
            cached,
            pending,
            channels
        );
    }
}
