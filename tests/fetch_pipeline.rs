use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use instagram_fetcher::config::FetchConfig;
use instagram_fetcher::error::UpstreamError;
use instagram_fetcher::key_pool::KeyPool;
use instagram_fetcher::models::{Endpoint, FetchMode};
use instagram_fetcher::store::{MemoryStore, PostStore};
use instagram_fetcher::testing::{MockUpstream, listing, node, test_config};
use instagram_fetcher::timestamp::TimestampSource;
use instagram_fetcher::upstream::Upstream;
use instagram_fetcher::{BatchControl, FetchError, Fetcher, run_batch};

fn fetcher(config: FetchConfig, upstream: Arc<MockUpstream>, store: Arc<MemoryStore>) -> Arc<Fetcher> {
    let keys = Arc::new(KeyPool::new(&config).unwrap());
    Arc::new(Fetcher::new(
        config,
        keys,
        upstream as Arc<dyn Upstream>,
        store as Arc<dyn PostStore>,
    ))
}

#[tokio::test]
async fn test_batch_then_incremental_rerun() {
    let upstream = Arc::new(MockUpstream::new());
    let store = Arc::new(MemoryStore::new());
    for name in ["nasa", "natgeo", "ghost"] {
        store.add_account(name).unwrap();
    }

    let now = Utc::now();
    upstream.page(
        Endpoint::Posts,
        "nasa",
        None,
        Ok(listing(
            vec![
                node("101", Some(now - ChronoDuration::hours(2))),
                node("102", Some(now - ChronoDuration::days(10))),
            ],
            None,
        )),
    );
    upstream.page(
        Endpoint::Posts,
        "natgeo",
        None,
        Ok(listing(vec![node("201", Some(now - ChronoDuration::hours(30)))], None)),
    );
    upstream.page(Endpoint::Posts, "ghost", None, Err(UpstreamError::NotFound));

    let fetcher = fetcher(test_config(2), Arc::clone(&upstream), Arc::clone(&store));

    let accounts = store.accounts().await.unwrap();
    let first = run_batch(
        Arc::clone(&fetcher),
        accounts,
        false,
        Arc::new(BatchControl::new()),
    )
    .await;

    assert_eq!(first.succeeded(), 2);
    assert!(first.accounts.iter().filter(|r| r.is_done()).all(|r| r.mode == FetchMode::Full));
    assert!(matches!(
        first.account("ghost").unwrap().error,
        Some(FetchError::AccountNotFound(_))
    ));
    assert_eq!(store.post_count(), 3);
    assert_eq!(store.last_fetched_at("ghost").await.unwrap(), None);

    // second pass: the 10 day old post falls outside the incremental window
    let accounts = store.accounts().await.unwrap();
    let second = run_batch(fetcher, accounts, false, Arc::new(BatchControl::new())).await;

    let nasa = second.account("nasa").unwrap();
    assert_eq!(nasa.mode, FetchMode::Incremental);
    assert_eq!(nasa.posts_updated, 1);
    assert_eq!(nasa.older_than_cutoff, 1);
    assert_eq!(second.account("ghost").unwrap().mode, FetchMode::Full);
    assert_eq!(store.post_count(), 3);
}

#[tokio::test]
async fn test_saved_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let upstream = Arc::new(MockUpstream::new());
    upstream.page(
        Endpoint::Posts,
        "nasa",
        None,
        Ok(listing(
            vec![
                node("1", Some(Utc::now() - ChronoDuration::hours(1))),
                json!({"pk": "broken-id"}),
            ],
            None,
        )),
    );

    let store = Arc::new(MemoryStore::new());
    store.add_account("NASA").unwrap();
    let fetcher = fetcher(test_config(1), upstream, Arc::clone(&store));
    let report = run_batch(
        fetcher,
        store.accounts().await.unwrap(),
        false,
        Arc::new(BatchControl::new()),
    )
    .await;
    assert_eq!(report.unresolved_timestamps(), 1);
    store.save(&path).unwrap();

    let restored = MemoryStore::load(&path).unwrap();
    assert!(restored.last_fetched_at("nasa").await.unwrap().is_some());
    let fallback = restored.post("nasa", "broken-id").unwrap();
    assert_eq!(fallback.timestamp_source, TimestampSource::FetchTime);
    assert_eq!(
        restored.post("nasa", "1").unwrap().timestamp_source,
        TimestampSource::TakenAt
    );
}

#[tokio::test]
async fn test_many_accounts_share_keys_within_caps() {
    let upstream = Arc::new(MockUpstream::new());
    let store = Arc::new(MemoryStore::new());
    for i in 0..15 {
        store.add_account(&format!("account{}", i)).unwrap();
    }

    // 5 keys, 2 calls per key per second, 30 calls in total
    let config = FetchConfig {
        calls_per_window: 2,
        rate_window: Duration::from_secs(1),
        acquire_rounds: 1_000,
        backoff: Duration::from_millis(20),
        workers: 15,
        ..test_config(5)
    };
    let fetcher = fetcher(config, Arc::clone(&upstream), Arc::clone(&store));

    let started = Instant::now();
    let report = run_batch(
        fetcher,
        store.accounts().await.unwrap(),
        false,
        Arc::new(BatchControl::new()),
    )
    .await;
    let elapsed = started.elapsed();

    assert_eq!(report.succeeded(), 15, "{:?}", report.accounts);
    let calls = upstream.calls();
    assert_eq!(calls.len(), 30);

    // 10 calls per window across the pool: 30 calls need at least two full windows
    assert!(elapsed >= Duration::from_secs(2), "finished in {:?}", elapsed);

    let keys: HashSet<&str> = calls.iter().map(|c| c.api_key.as_str()).collect();
    assert_eq!(keys.len(), 5);
}
