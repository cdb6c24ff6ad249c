use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use crate::error::FetchError;
use crate::metrics::TASK_OUTCOMES;
use crate::models::Account;
use crate::orchestrator::{AccountReport, CancelFlag, Fetcher};

// One account waiting for a worker
struct Job {
    account: Account,
    cancel: CancelFlag,
}

/// Cancellation handles for the accounts of a running batch.
#[derive(Default)]
pub struct BatchControl {
    flags: DashMap<String, CancelFlag>, // username -> flag
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, username: &str) -> CancelFlag {
        self.flags.entry(username.to_string()).or_default().clone()
    }

    /// Stop an account before its next page. False when it is not in the batch.
    pub fn cancel(&self, username: &str) -> bool {
        match self.flags.get(username) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for flag in self.flags.iter() {
            flag.cancel();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub full_refresh: bool,
    pub accounts: Vec<AccountReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.accounts.iter().filter(|r| r.is_done()).count()
    }

    pub fn cancelled(&self) -> usize {
        self.accounts
            .iter()
            .filter(|r| matches!(r.error, Some(FetchError::Cancelled)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.accounts.len() - self.succeeded()
    }

    pub fn posts_created(&self) -> u32 {
        self.accounts.iter().map(|r| r.posts_created).sum()
    }

    pub fn unresolved_timestamps(&self) -> u32 {
        self.accounts.iter().map(|r| r.unresolved_timestamps).sum()
    }

    pub fn account(&self, username: &str) -> Option<&AccountReport> {
        self.accounts.iter().find(|r| r.username == username)
    }
}

/// Fetch every account on a bounded pool of workers. Accounts are
/// independent; one failing never stops the others.
pub async fn run_batch(
    fetcher: Arc<Fetcher>,
    accounts: Vec<Account>,
    full_refresh: bool,
    control: Arc<BatchControl>,
) -> BatchReport {
    let started_at = Utc::now();
    let capacity = accounts.len().max(1);
    let workers = fetcher.workers().clamp(1, capacity);

    info!(
        accounts = accounts.len(),
        workers, full_refresh, "Starting fetch batch"
    );

    let (job_tx, job_rx) = mpsc::channel::<Job>(capacity);
    let (result_tx, mut result_rx) = mpsc::channel::<AccountReport>(capacity);

    // queue everything up front, the channel holds the whole batch
    for account in accounts {
        let cancel = control.register(&account.username);
        if job_tx.send(Job { account, cancel }).await.is_err() {
            break;
        }
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers {
        handles.push(tokio::spawn(fetch_worker(
            id,
            Arc::clone(&fetcher),
            Arc::clone(&job_rx),
            full_refresh,
            result_tx.clone(),
        )));
    }
    drop(result_tx);

    let mut reports = Vec::with_capacity(capacity);
    while let Some(report) = result_rx.recv().await {
        reports.push(report);
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Fetch worker crashed");
        }
    }

    reports.sort_by(|a, b| a.username.cmp(&b.username));
    let report = BatchReport {
        started_at,
        finished_at: Utc::now(),
        full_refresh,
        accounts: reports,
    };
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        cancelled = report.cancelled(),
        posts_created = report.posts_created(),
        unresolved = report.unresolved_timestamps(),
        "Fetch batch finished"
    );
    report
}

// Pull accounts off the shared queue until it drains
async fn fetch_worker(
    id: usize,
    fetcher: Arc<Fetcher>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    full_refresh: bool,
    results: mpsc::Sender<AccountReport>,
) {
    debug!(worker = id, "Fetch worker started");

    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else { break };

        // own task, so a panic is pinned to this account
        let username = job.account.username.clone();
        let started_at = Utc::now();
        let task_fetcher = Arc::clone(&fetcher);
        let task = tokio::spawn(async move {
            task_fetcher
                .fetch_account(job.account, full_refresh, &job.cancel)
                .await
        });

        let report = match task.await {
            Ok(report) => report,
            Err(e) => {
                error!(worker = id, username = %username, error = %e, "Account fetch crashed");
                TASK_OUTCOMES.with_label_values(&["crashed"]).inc();
                AccountReport::crashed(&username, started_at, e.to_string())
            }
        };
        if results.send(report).await.is_err() {
            break;
        }
    }

    debug!(worker = id, "Fetch worker finished");
}
