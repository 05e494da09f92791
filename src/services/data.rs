//! Cached, coalesced one-shot reads and draft-protected writes

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::drafts::DraftStore;
use crate::{
    error::{AppError, AppResult},
    repository::{CacheStore, Claim, PendingRegistry, Repository},
};

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Serve from and populate the cache
    pub use_cache: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

impl FetchOptions {
    pub fn uncached() -> Self {
        Self { use_cache: false }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Keep a local draft of the payload until the save succeeds
    pub auto_save: bool,
}

/// Data access facade shared by every consumer in the process
#[derive(Clone)]
pub struct DataAccess {
    cache: Arc<CacheStore>,
    pending: Arc<PendingRegistry>,
    drafts: Arc<dyn DraftStore>,
    ttl: Duration,
}

impl DataAccess {
    pub fn new(repository: &Repository, drafts: Arc<dyn DraftStore>, ttl: Duration) -> Self {
        Self {
            cache: repository.cache.clone(),
            pending: repository.pending.clone(),
            drafts,
            ttl,
        }
    }

    /// Read `key`, from the cache when allowed, otherwise through `fetcher`.
    ///
    /// Callers arriving while a fetch for `key` is in flight share its
    /// outcome; `fetcher` is only invoked by the first of them. Failures are
    /// returned as [`AppError::Fetch`] and never retried here.
    pub async fn get_data<T, F, Fut, E>(&self, key: &str, fetcher: F, options: FetchOptions) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if options.use_cache {
            if let Some(value) = self.cache.get(key) {
                tracing::debug!("Cache hit for {}", key);
                return decode(key, value);
            }
        }

        let outcome = match self.pending.claim(key) {
            Claim::Follower(outcome) => {
                tracing::debug!("Joining in-flight fetch of {}", key);
                outcome
            }
            Claim::Leader(ticket) => {
                let outcome = ticket.subscribe();
                let request = fetcher();
                let cache = self.cache.clone();
                let ttl = self.ttl;
                let key = key.to_string();

                // runs detached so waiters are served even if this caller goes away
                tokio::spawn(async move {
                    let result = match request.await {
                        Ok(data) => serde_json::to_value(&data).map_err(AppError::from),
                        Err(e) => Err(AppError::Fetch(e.to_string())),
                    };
                    if let Err(e) = &result {
                        tracing::warn!("Fetch of {} failed: {}", key, e);
                    }
                    if !options.use_cache {
                        ticket.settle(result);
                    } else if !ticket.settle_and_store(result, |value| cache.insert(&key, value.clone(), ttl)) {
                        tracing::debug!("Result for {} not cached: invalidated while in flight", key);
                    }
                });
                outcome
            }
        };

        let value = PendingRegistry::wait(outcome).await?;
        decode(key, value)
    }

    /// Write `payload` through `saver`.
    ///
    /// With `auto_save` a draft is stored first and only cleared once the save
    /// succeeds. A successful save drops the cached value for `key`.
    pub async fn save_data<P, T, F, Fut, E>(
        &self,
        key: &str,
        payload: P,
        saver: F,
        options: SaveOptions,
    ) -> AppResult<T>
    where
        P: Serialize,
        F: FnOnce(P) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if options.auto_save {
            match serde_json::to_value(&payload) {
                Ok(draft) => {
                    if let Err(e) = self.drafts.save_draft(key, &draft).await {
                        tracing::warn!("Could not keep a draft of {}: {}", key, e);
                    }
                }
                Err(e) => tracing::warn!("Could not serialize draft of {}: {}", key, e),
            }
        }

        match saver(payload).await {
            Ok(saved) => {
                if options.auto_save {
                    if let Err(e) = self.drafts.clear_draft(key).await {
                        tracing::warn!("Could not clear draft of {}: {}", key, e);
                    }
                }
                self.invalidate(key);
                Ok(saved)
            }
            Err(e) => {
                let error = AppError::Save(e.to_string());
                tracing::warn!("Save of {} failed: {}", key, error);
                Err(error)
            }
        }
    }

    /// Drop the cached value for `key` and detach any fetch in flight, so
    /// the next read goes to the source
    pub fn invalidate(&self, key: &str) -> bool {
        // detach first: a leader settling in between is then either refused
        // or its entry removed below
        self.pending.detach(key);
        self.cache.invalidate(key)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.pending.detach_prefix(prefix);
        self.cache.invalidate_prefix(prefix)
    }

    /// Draft left behind by an unsuccessful save, if any
    pub async fn load_draft(&self, key: &str) -> AppResult<Option<Value>> {
        self.drafts.load_draft(key).await
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> AppResult<T> {
    serde_json::from_value(value)
        .map_err(|e| AppError::Decode(format!("unexpected shape for {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::drafts::{MemoryDraftStore, MockDraftStore};
    use futures_util::future::BoxFuture;
    use mockall::Sequence;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn facade() -> (DataAccess, Repository) {
        let repository = Repository::new();
        let data = DataAccess::new(
            &repository,
            Arc::new(MemoryDraftStore::new()),
            Duration::from_secs(300),
        );
        (data, repository)
    }

    type Fetch = BoxFuture<'static, Result<Vec<u32>, String>>;

    fn counted(calls: &Arc<AtomicUsize>, value: Vec<u32>) -> impl FnOnce() -> Fetch {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let fetch: Fetch = Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            });
            fetch
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_share_one_fetch() {
        let (data, repository) = facade();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            data.get_data("books", counted(&calls, vec![1, 2]), FetchOptions::default()),
            data.get_data("books", counted(&calls, vec![9]), FetchOptions::default()),
            data.get_data("books", counted(&calls, vec![9]), FetchOptions::default()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), vec![1, 2]);
        assert_eq!(b.unwrap(), vec![1, 2]);
        assert_eq!(c.unwrap(), vec![1, 2]);
        assert!(repository.pending.is_empty());
        assert_eq!(repository.cache.get("books"), Some(json!([1, 2])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let (data, _) = facade();
        let calls = Arc::new(AtomicUsize::new(0));

        let first: Vec<u32> = data
            .get_data("users", counted(&calls, vec![1]), FetchOptions::default())
            .await
            .unwrap();
        let cached: Vec<u32> = data
            .get_data("users", counted(&calls, vec![2]), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(first, cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let fresh: Vec<u32> = data
            .get_data("users", counted(&calls, vec![2]), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(fresh, vec![2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncached_read_skips_cache() {
        let (data, repository) = facade();
        let calls = Arc::new(AtomicUsize::new(0));
        repository.cache.insert("stats", json!([7]), Duration::from_secs(60));

        let value: Vec<u32> = data
            .get_data("stats", counted(&calls, vec![8]), FetchOptions::uncached())
            .await
            .unwrap();

        assert_eq!(value, vec![8]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // the stale entry is left alone
        assert_eq!(repository.cache.get("stats"), Some(json!([7])));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached_and_frees_the_key() {
        let (data, repository) = facade();

        let failed: AppResult<Vec<u32>> = data
            .get_data("loans", || async { Err::<Vec<u32>, _>("timeout") }, FetchOptions::default())
            .await;
        assert_eq!(failed, Err(AppError::Fetch("timeout".to_string())));
        assert!(repository.cache.is_empty());
        assert!(!repository.pending.contains("loans"));

        let retried: Vec<u32> = data
            .get_data("loans", || async { Ok::<_, String>(vec![4]) }, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(retried, vec![4]);
    }

    #[tokio::test]
    async fn test_successful_save_invalidates_and_clears_draft() {
        let mut drafts = MockDraftStore::new();
        let mut seq = Sequence::new();
        drafts
            .expect_save_draft()
            .withf(|key, payload| key == "book:7" && payload["title"] == "Dune")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        drafts
            .expect_clear_draft()
            .withf(|key| key == "book:7")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let repository = Repository::new();
        repository.cache.insert("book:7", json!({"title": "Old"}), Duration::from_secs(60));
        let data = DataAccess::new(&repository, Arc::new(drafts), Duration::from_secs(300));

        let saved: Value = data
            .save_data(
                "book:7",
                json!({"title": "Dune"}),
                |payload| async move { Ok::<_, String>(payload) },
                SaveOptions { auto_save: true },
            )
            .await
            .unwrap();

        assert_eq!(saved["title"], "Dune");
        assert!(repository.cache.get("book:7").is_none());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_draft_and_cache() {
        let (data, repository) = facade();
        repository.cache.insert("user:3", json!({"name": "Ada"}), Duration::from_secs(60));

        let result: AppResult<Value> = data
            .save_data(
                "user:3",
                json!({"name": "Ada L."}),
                |_| async { Err::<Value, _>("permission denied") },
                SaveOptions { auto_save: true },
            )
            .await;

        assert_eq!(result, Err(AppError::Save("permission denied".to_string())));
        assert_eq!(data.load_draft("user:3").await.unwrap(), Some(json!({"name": "Ada L."})));
        assert!(repository.cache.get("user:3").is_some());
    }

    #[tokio::test]
    async fn test_save_during_fetch_discards_stale_result() {
        let (data, repository) = facade();
        let server = Arc::new(AtomicUsize::new(1));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let reader = data.clone();
        let snapshot = server.clone();
        let first = tokio::spawn(async move {
            reader
                .get_data::<usize, _, _, String>(
                    "book:7",
                    move || {
                        let value = snapshot.load(Ordering::SeqCst);
                        async move {
                            let _ = gate.await;
                            Ok(value)
                        }
                    },
                    FetchOptions::default(),
                )
                .await
        });
        while !repository.pending.contains("book:7") {
            tokio::task::yield_now().await;
        }

        let store = server.clone();
        data.save_data(
            "book:7",
            2usize,
            move |value| async move {
                store.store(value, Ordering::SeqCst);
                Ok::<_, String>(())
            },
            SaveOptions::default(),
        )
        .await
        .unwrap();
        assert!(!repository.pending.contains("book:7"));

        release.send(()).unwrap();
        // callers that asked before the save still get the earlier answer
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert!(repository.cache.get("book:7").is_none());

        let current = server.clone();
        let next: usize = data
            .get_data(
                "book:7",
                move || {
                    let value = current.load(Ordering::SeqCst);
                    async move { Ok::<_, String>(value) }
                },
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn test_save_without_auto_save_skips_drafts() {
        let drafts = MockDraftStore::new();
        let data = DataAccess::new(&Repository::new(), Arc::new(drafts), Duration::from_secs(300));

        let saved: u32 = data
            .save_data("count", 3u32, |n| async move { Ok::<_, String>(n + 1) }, SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(saved, 4);
    }
}
