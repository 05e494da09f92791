//! Data access facade over the shared stores

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use elidune_sync::{
    error::{AppError, DataResponse},
    repository::Repository,
    services::{
        data::{DataAccess, FetchOptions, SaveOptions},
        drafts::{DraftStore, MemoryDraftStore},
    },
};

fn facade(ttl: Duration) -> (DataAccess, Repository, Arc<MemoryDraftStore>) {
    let repository = Repository::new();
    let drafts = Arc::new(MemoryDraftStore::new());
    let data = DataAccess::new(&repository, drafts.clone(), ttl);
    (data, repository, drafts)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_readers_coalesce_and_cache_expires() {
    let (data, repository, _) = facade(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let read = |data: DataAccess, calls: Arc<AtomicUsize>| async move {
        data.get_data(
            "books:recent",
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(vec![format!("batch {}", n)])
            },
            FetchOptions::default(),
        )
        .await
    };

    let readers = (0..8).map(|_| read(data.clone(), calls.clone()));
    let results: Vec<Vec<String>> = futures_util::future::join_all(readers)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r == &vec!["batch 1".to_string()]));
    assert!(repository.pending.is_empty());

    tokio::time::advance(Duration::from_secs(61)).await;
    let refreshed = read(data.clone(), calls.clone()).await.unwrap();
    assert_eq!(refreshed, vec!["batch 2".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_save_leaves_draft_for_retry() {
    let (data, _, drafts) = facade(Duration::from_secs(60));
    let payload = json!({"title": "Les Misérables", "isbn": "978-2070409228"});

    let result: Result<(), AppError> = data
        .save_data(
            "book:new",
            payload.clone(),
            |_| async { Err::<(), _>("duplicate isbn") },
            SaveOptions { auto_save: true },
        )
        .await;
    let response = DataResponse::from(result);
    assert_eq!(response.error.as_deref(), Some("duplicate isbn"));
    assert_eq!(data.load_draft("book:new").await.unwrap(), Some(payload.clone()));

    let saved: u64 = data
        .save_data(
            "book:new",
            payload,
            |_| async { Ok::<_, String>(7) },
            SaveOptions { auto_save: true },
        )
        .await
        .unwrap();
    assert_eq!(saved, 7);
    assert_eq!(drafts.load_draft("book:new").await.unwrap(), None);
}

#[tokio::test]
async fn test_save_invalidates_cached_read() {
    let (data, repository, _) = facade(Duration::from_secs(60));

    let first: u64 = data
        .get_data("users:count", || async { Ok::<_, String>(10) }, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(first, 10);
    assert!(repository.cache.get("users:count").is_some());

    data.save_data("users:count", (), |_| async { Ok::<_, String>(()) }, SaveOptions::default())
        .await
        .unwrap();
    assert!(repository.cache.get("users:count").is_none());

    let second: u64 = data
        .get_data("users:count", || async { Ok::<_, String>(11) }, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(second, 11);
}

#[tokio::test]
async fn test_cleanup_resets_every_store() {
    let (data, repository, _) = facade(Duration::from_secs(60));
    let overdue: Vec<u8> = tokio_test::assert_ok!(
        data.get_data("loans:overdue", || async { Ok::<_, String>(vec![1, 2]) }, FetchOptions::default())
            .await
    );
    assert_eq!(overdue, vec![1, 2]);
    assert_eq!(repository.cache.len(), 1);

    repository.cleanup();
    assert!(repository.cache.is_empty());
    assert!(repository.pending.is_empty());
    assert!(repository.channels.is_empty());
}
