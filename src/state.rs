use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::orchestrator::Fetcher;
use crate::store::{MemoryStore, PostStore};
use crate::worker::{BatchControl, BatchReport, run_batch};

// app's shared state in serve mode
pub struct AppState {
    pub fetcher: Arc<Fetcher>,
    pub store: Arc<MemoryStore>,
    pub state_path: PathBuf,
    running: AtomicBool,
    control: RwLock<Arc<BatchControl>>, // handles of the current (or last) batch
    last_report: RwLock<Option<BatchReport>>,
}

impl AppState {
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<MemoryStore>, state_path: PathBuf) -> Self {
        Self {
            fetcher,
            store,
            state_path,
            running: AtomicBool::new(false),
            control: RwLock::new(Arc::new(BatchControl::new())),
            last_report: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn last_report(&self) -> Option<BatchReport> {
        self.last_report.read().await.clone()
    }

    pub async fn cancel(&self, username: &str) -> bool {
        self.is_running() && self.control.read().await.cancel(username)
    }

    /// Run one batch over every tracked account and persist the store.
    /// Returns None without doing anything when a batch is already running.
    pub async fn run_once(&self, full_refresh: bool) -> Option<BatchReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Fetch batch already running, skipping");
            return None;
        }

        let report = self.run_batch(full_refresh).await;
        self.running.store(false, Ordering::SeqCst);
        report
    }

    // std::fs under the hood, kept off the runtime threads
    async fn save(&self) {
        let store = Arc::clone(&self.store);
        let path = self.state_path.clone();
        match tokio::task::spawn_blocking(move || store.save(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(path = %self.state_path.display(), error = %e, "Failed to save state");
            }
            Err(e) => {
                error!(path = %self.state_path.display(), error = %e, "State save task failed");
            }
        }
    }

    async fn run_batch(&self, full_refresh: bool) -> Option<BatchReport> {
        let accounts = match self.store.accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "Failed to list accounts");
                return None;
            }
        };
        if accounts.is_empty() {
            info!("No accounts tracked, nothing to fetch");
        }

        let control = Arc::new(BatchControl::new());
        *self.control.write().await = Arc::clone(&control);

        let report = run_batch(Arc::clone(&self.fetcher), accounts, full_refresh, control).await;
        self.save().await;

        *self.last_report.write().await = Some(report.clone());
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pool::KeyPool;
    use crate::testing::{MockUpstream, test_config};
    use crate::upstream::Upstream;

    fn app(dir: &std::path::Path) -> AppState {
        let store = Arc::new(MemoryStore::new());
        store.add_account("nasa").unwrap();
        let config = test_config(1);
        let keys = Arc::new(KeyPool::new(&config).unwrap());
        let fetcher = Fetcher::new(
            config,
            keys,
            Arc::new(MockUpstream::new()) as Arc<dyn Upstream>,
            store.clone() as Arc<dyn PostStore>,
        );
        AppState::new(Arc::new(fetcher), store, dir.join("state.json"))
    }

    #[tokio::test]
    async fn test_run_once_saves_and_records_report() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let report = app.run_once(false).await.unwrap();
        assert_eq!(report.succeeded(), 1);
        assert!(!app.is_running());
        assert!(app.last_report().await.is_some());

        let saved = MemoryStore::load(&dir.path().join("state.json")).unwrap();
        assert!(saved.last_fetched_at("nasa").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_save_still_records_report() {
        let dir = tempfile::tempdir().unwrap();
        // the state path is a directory, so the rename fails
        let app = app(dir.path());
        std::fs::create_dir(dir.path().join("state.json")).unwrap();

        let report = app.run_once(false).await.unwrap();
        assert_eq!(report.succeeded(), 1);
        assert!(!app.is_running());
        assert!(app.last_report().await.is_some());
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        app.running.store(true, Ordering::SeqCst);
        assert!(app.run_once(false).await.is_none());
        assert!(app.last_report().await.is_none());
    }
}
