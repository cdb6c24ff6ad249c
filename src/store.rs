use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{Account, EngagementSnapshot, Post, normalize_username};
use crate::timestamp::{TimestampSource, decode_post_id};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Persistence the fetch engine writes through. Writes are per record;
/// nothing here spans accounts.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn accounts(&self) -> Result<Vec<Account>>;

    async fn last_fetched_at(&self, username: &str) -> Result<Option<DateTime<Utc>>>;

    /// Insert or refresh by (account, post id). An existing post keeps its
    /// resolved creation time.
    async fn upsert_post(&self, post: Post) -> Result<UpsertOutcome>;

    async fn append_snapshot(&self, snapshot: EngagementSnapshot) -> Result<()>;

    async fn mark_fetched(&self, username: &str, at: DateTime<Utc>) -> Result<()>;
}

// On-disk form of the memory store
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    accounts: Vec<Account>,
    posts: Vec<Post>,
    #[serde(default)]
    snapshots: Vec<EngagementSnapshot>,
}

// In-memory store, one map entry per record
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<String, Account>,
    posts: DashMap<(String, String), Post>, // (account, post id) -> post
    snapshots: Mutex<Vec<EngagementSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON snapshot; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let store = Self::new();
        if !path.exists() {
            info!(path = %path.display(), "No state file yet, starting empty");
            return Ok(store);
        }

        let content = std::fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)?;
        for account in snapshot.accounts {
            store.accounts.insert(account.username.clone(), account);
        }
        for post in snapshot.posts {
            store
                .posts
                .insert((post.account.clone(), post.post_id.clone()), post);
        }
        if let Ok(mut snapshots) = store.snapshots.lock() {
            *snapshots = snapshot.snapshots;
        }

        info!(
            path = %path.display(),
            accounts = store.accounts.len(),
            posts = store.posts.len(),
            "Loaded state"
        );
        Ok(store)
    }

    /// Write a JSON snapshot through a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));

        let mut posts: Vec<Post> = self.posts.iter().map(|e| e.value().clone()).collect();
        posts.sort_by(|a, b| {
            (a.account.as_str(), b.taken_at).cmp(&(b.account.as_str(), a.taken_at))
        });

        let snapshots = self
            .snapshots
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Snapshot("snapshot lock poisoned".to_string()))?;

        let snapshot = StoreSnapshot {
            accounts,
            posts,
            snapshots,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;

        debug!(path = %path.display(), "Saved state");
        Ok(())
    }

    /// Register an account. Returns false when it already exists.
    pub fn add_account(&self, username: &str) -> Result<bool> {
        let account = Account::new(username);
        if account.username.is_empty() {
            return Err(StoreError::InvalidUsername(username.to_string()));
        }
        match self.accounts.entry(account.username.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(account);
                Ok(true)
            }
        }
    }

    pub fn post(&self, username: &str, post_id: &str) -> Option<Post> {
        self.posts
            .get(&(username.to_string(), post_id.to_string()))
            .map(|p| p.value().clone())
    }

    pub fn posts_for(&self, username: &str) -> Vec<Post> {
        let mut posts: Vec<Post> = self
            .posts
            .iter()
            .filter(|e| e.key().0 == username)
            .map(|e| e.value().clone())
            .collect();
        posts.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        posts
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Re-derive fetch-time fallbacks from post ids. Returns (fixed, still unresolved).
    pub fn repair_timestamps(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut fixed = 0;
        let mut failed = 0;
        for mut entry in self.posts.iter_mut() {
            let post = entry.value_mut();
            if !post.timestamp_unresolved() {
                continue;
            }
            match decode_post_id(&post.post_id) {
                Ok(at) if at <= now => {
                    post.taken_at = at;
                    post.timestamp_source = TimestampSource::PostId;
                    fixed += 1;
                }
                _ => failed += 1,
            }
        }
        (fixed, failed)
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(accounts)
    }

    async fn last_fetched_at(&self, username: &str) -> Result<Option<DateTime<Utc>>> {
        let username = normalize_username(username);
        self.accounts
            .get(&username)
            .map(|a| a.last_fetched_at)
            .ok_or(StoreError::UnknownAccount(username))
    }

    async fn upsert_post(&self, post: Post) -> Result<UpsertOutcome> {
        if !self.accounts.contains_key(&post.account) {
            return Err(StoreError::UnknownAccount(post.account));
        }

        match self.posts.entry((post.account.clone(), post.post_id.clone())) {
            Entry::Vacant(slot) => {
                slot.insert(post);
                Ok(UpsertOutcome::Created)
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                // a real signal replaces a fetch-time fallback, nothing else does
                if stored.timestamp_unresolved() && !post.timestamp_unresolved() {
                    stored.taken_at = post.taken_at;
                    stored.timestamp_source = post.timestamp_source;
                }
                stored.code = post.code.or(stored.code.take());
                stored.caption = post.caption;
                stored.kind = post.kind;
                stored.image_url = post.image_url;
                stored.video_url = post.video_url;
                stored.like_count = post.like_count;
                stored.comment_count = post.comment_count;
                stored.play_count = post.play_count;
                stored.carousel = post.carousel;
                stored.updated_at = post.updated_at;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn append_snapshot(&self, snapshot: EngagementSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .map_err(|_| StoreError::Snapshot("snapshot lock poisoned".to_string()))?
            .push(snapshot);
        Ok(())
    }

    async fn mark_fetched(&self, username: &str, at: DateTime<Utc>) -> Result<()> {
        let mut account = self
            .accounts
            .get_mut(username)
            .ok_or_else(|| StoreError::UnknownAccount(username.to_string()))?;
        account.last_fetched_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Endpoint, RawPost};
    use crate::timestamp::Resolution;
    use chrono::{Duration, TimeZone};

    fn post(id: &str, taken_at: DateTime<Utc>, source: TimestampSource, likes: i64) -> Post {
        let resolution = Resolution {
            instant: taken_at,
            source,
            rejected: Vec::new(),
        };
        let raw = RawPost {
            id: id.to_string(),
            like_count: likes,
            ..RawPost::default()
        };
        Post::from_raw("nasa", raw, Endpoint::Posts, &resolution, Utc::now())
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_account("@NASA").unwrap();
        store
    }

    #[test]
    fn test_add_account_normalizes_and_dedupes() {
        let store = store();
        assert!(!store.add_account("nasa ").unwrap());
        assert!(store.add_account("natgeo").unwrap());
        assert!(matches!(
            store.add_account(" @ "),
            Err(StoreError::InvalidUsername(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_keeps_original_timestamp() {
        let store = store();
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = first + Duration::days(3);

        let outcome = store
            .upsert_post(post("1", first, TimestampSource::TakenAt, 10))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);

        let outcome = store
            .upsert_post(post("1", later, TimestampSource::CaptionCreatedAt, 25))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        assert_eq!(store.post_count(), 1);
        let stored = store.post("nasa", "1").unwrap();
        assert_eq!(stored.like_count, 25);
        assert_eq!(stored.taken_at, first);
        assert_eq!(stored.timestamp_source, TimestampSource::TakenAt);
    }

    #[tokio::test]
    async fn test_real_signal_replaces_fallback() {
        let store = store();
        let fetched = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        let real = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        store
            .upsert_post(post("1", fetched, TimestampSource::FetchTime, 1))
            .await
            .unwrap();
        store
            .upsert_post(post("1", real, TimestampSource::TakenAt, 1))
            .await
            .unwrap();

        let stored = store.post("nasa", "1").unwrap();
        assert_eq!(stored.taken_at, real);
        assert!(!stored.timestamp_unresolved());
    }

    #[tokio::test]
    async fn test_unknown_account_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .upsert_post(post("1", Utc::now(), TimestampSource::TakenAt, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownAccount(name) if name == "nasa"));
        assert!(store.mark_fetched("nasa", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let fetched = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let store = store();
        let p = post("1", fetched - Duration::hours(1), TimestampSource::TakenAt, 7);
        store
            .append_snapshot(EngagementSnapshot::of(&p, fetched))
            .await
            .unwrap();
        store.upsert_post(p).await.unwrap();
        store.mark_fetched("nasa", fetched).await.unwrap();
        store.save(&path).unwrap();

        let loaded = MemoryStore::load(&path).unwrap();
        assert_eq!(loaded.last_fetched_at("nasa").await.unwrap(), Some(fetched));
        assert_eq!(loaded.post("nasa", "1").unwrap().like_count, 7);
        assert_eq!(loaded.snapshot_count(), 1);

        let missing = MemoryStore::load(&dir.path().join("absent.json")).unwrap();
        assert!(missing.accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repair_timestamps_decodes_fallbacks() {
        let store = store();
        let fetched = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        store
            .upsert_post(post("2457894561230147852", fetched, TimestampSource::FetchTime, 1))
            .await
            .unwrap();
        store
            .upsert_post(post("not-numeric", fetched, TimestampSource::FetchTime, 1))
            .await
            .unwrap();

        assert_eq!(store.repair_timestamps(fetched), (1, 1));
        let fixed = store.post("nasa", "2457894561230147852").unwrap();
        assert_eq!(fixed.timestamp_source, TimestampSource::PostId);
        assert_eq!(fixed.taken_at.timestamp_millis(), 1_607_223_886_155);
    }
}
