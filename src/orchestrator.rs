//! Per-account fetch task.
//!
//! A task moves through `Idle -> Deciding -> Fetching <-> Reconciling ->
//! Done | Failed`. Pages are reconciled as they arrive, so a task that fails
//! half way keeps everything it already stored; upserts are idempotent and a
//! retry simply repeats the work. The account's last fetch time only moves
//! forward when the whole task succeeds.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::debug_dump::ResponseRecorder;
use crate::error::{FetchError, Result};
use crate::key_pool::KeyPool;
use crate::metrics::{
    ACCOUNT_FETCH_LATENCY, PAGES_FETCHED, PAGES_SKIPPED, POSTS_CREATED, POSTS_UPDATED,
    TASK_OUTCOMES, UNRESOLVED_TIMESTAMPS,
};
use crate::models::{Account, EngagementSnapshot, Endpoint, FetchMode, FetchTask, Post, RawPost};
use crate::parse::{PageError, parse_page};
use crate::store::{PostStore, UpsertOutcome};
use crate::timestamp;
use crate::upstream::Upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    Deciding,
    Fetching,
    Reconciling,
    Done,
    Failed,
}

/// Cooperative cancellation, checked before every page request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub username: String,
    pub mode: FetchMode,
    pub state: FetchState,
    #[serde(serialize_with = "error_message")]
    pub error: Option<FetchError>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub pages: u32,
    pub posts_created: u32,
    pub posts_updated: u32,
    pub unresolved_timestamps: u32,
    pub malformed_items: u32,
    pub skipped_pages: u32,
    // incremental only
    pub older_than_cutoff: u32,
}

fn error_message<S: Serializer>(
    error: &Option<FetchError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl AccountReport {
    fn new(username: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            username: username.to_string(),
            mode: FetchMode::Full,
            state: FetchState::Idle,
            error: None,
            started_at,
            elapsed_ms: 0,
            pages: 0,
            posts_created: 0,
            posts_updated: 0,
            unresolved_timestamps: 0,
            malformed_items: 0,
            skipped_pages: 0,
            older_than_cutoff: 0,
        }
    }

    fn enter(&mut self, next: FetchState) {
        if self.state != next {
            debug!(username = %self.username, from = ?self.state, to = ?next, "Fetch state");
            self.state = next;
        }
    }

    /// Report for a task that died without producing its own.
    pub fn crashed(username: &str, started_at: DateTime<Utc>, reason: String) -> Self {
        Self {
            state: FetchState::Failed,
            error: Some(FetchError::Crashed(reason)),
            ..Self::new(username, started_at)
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == FetchState::Done
    }
}

pub struct Fetcher {
    config: FetchConfig,
    keys: Arc<KeyPool>,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn PostStore>,
    recorder: Option<ResponseRecorder>,
}

impl Fetcher {
    pub fn new(
        config: FetchConfig,
        keys: Arc<KeyPool>,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn PostStore>,
    ) -> Self {
        let recorder = config.debug_dump.as_ref().map(ResponseRecorder::new);
        Self {
            config,
            keys,
            upstream,
            store,
            recorder,
        }
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    /// Run one account's task to completion and report what happened.
    pub async fn fetch_account(
        &self,
        account: Account,
        full_refresh: bool,
        cancel: &CancelFlag,
    ) -> AccountReport {
        let clock = Instant::now();
        let started_at = Utc::now();
        // None when the budget reaches past what Instant can represent
        let deadline = clock.checked_add(self.config.account_budget);
        let mut report = AccountReport::new(&account.username, started_at);

        let result = self
            .run(account, full_refresh, started_at, deadline, cancel, &mut report)
            .await;

        match result {
            Ok(()) => {
                report.enter(FetchState::Done);
                TASK_OUTCOMES.with_label_values(&["done"]).inc();
            }
            Err(e) => {
                report.enter(FetchState::Failed);
                TASK_OUTCOMES.with_label_values(&[e.kind()]).inc();
                report.error = Some(e);
            }
        }

        let elapsed = clock.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        ACCOUNT_FETCH_LATENCY.observe(elapsed.as_secs_f64());

        match &report.error {
            None => info!(
                username = %report.username,
                mode = report.mode.as_str(),
                pages = report.pages,
                created = report.posts_created,
                updated = report.posts_updated,
                unresolved = report.unresolved_timestamps,
                "Account fetch done"
            ),
            Some(e) => warn!(
                username = %report.username,
                mode = report.mode.as_str(),
                pages = report.pages,
                created = report.posts_created,
                error = %e,
                "Account fetch failed, partial progress kept"
            ),
        }
        report
    }

    async fn run(
        &self,
        account: Account,
        full_refresh: bool,
        started_at: DateTime<Utc>,
        deadline: Option<Instant>,
        cancel: &CancelFlag,
        report: &mut AccountReport,
    ) -> Result<()> {
        report.enter(FetchState::Deciding);
        let last_fetched_at = self.store.last_fetched_at(&account.username).await?;
        let task = FetchTask::plan(
            Account {
                last_fetched_at,
                ..account
            },
            full_refresh,
        );
        report.mode = task.mode;

        let cutoff = task.cutoff(started_at, self.config.incremental_window);
        info!(
            username = %task.account.username,
            mode = task.mode.as_str(),
            cutoff = ?cutoff,
            "Fetching account"
        );

        let mut endpoints = vec![Endpoint::Posts];
        if self.config.include_reels {
            endpoints.push(Endpoint::Reels);
        }
        for endpoint in endpoints {
            self.fetch_listing(&task, endpoint, cutoff, deadline, cancel, report)
                .await?;
        }

        // fetch start, not newest post, so posts published mid-fetch are seen next time
        self.store
            .mark_fetched(&task.account.username, started_at)
            .await?;
        Ok(())
    }

    async fn fetch_listing(
        &self,
        task: &FetchTask,
        endpoint: Endpoint,
        cutoff: Option<DateTime<Utc>>,
        deadline: Option<Instant>,
        cancel: &CancelFlag,
        report: &mut AccountReport,
    ) -> Result<()> {
        let username = &task.account.username;
        let mut cursor: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(FetchError::BudgetExhausted(self.config.account_budget));
            }

            report.enter(FetchState::Fetching);
            let body = self.fetch_page(endpoint, username, cursor.as_deref(), deadline).await?;
            let fetched_at = Utc::now();
            report.pages += 1;
            PAGES_FETCHED.inc();

            if let Some(recorder) = &self.recorder {
                recorder.record(endpoint, username, &body).await;
            }

            let page = match parse_page(&body, cursor.as_deref()) {
                Ok(page) => page,
                // incremental mode can only skip a page that ends the listing
                Err(PageError::Items { reason, next })
                    if task.mode == FetchMode::Full || !next.has_next =>
                {
                    report.skipped_pages += 1;
                    PAGES_SKIPPED.inc();
                    warn!(
                        username = %username,
                        endpoint = endpoint.as_str(),
                        page = report.pages,
                        reason = %reason,
                        "Skipping malformed page"
                    );
                    if !next.has_next {
                        return Ok(());
                    }
                    cursor = next.cursor;
                    continue;
                }
                Err(e) => return Err(FetchError::MalformedResponse(e.reason().to_string())),
            };

            report.enter(FetchState::Reconciling);
            report.malformed_items += page.malformed_items as u32;
            let reached_cutoff = self
                .reconcile(task, endpoint, page.items, cutoff, fetched_at, report)
                .await?;

            if reached_cutoff {
                info!(
                    username = %username,
                    endpoint = endpoint.as_str(),
                    "Reached posts older than the incremental window, stopping"
                );
                return Ok(());
            }
            if !page.next.has_next {
                return Ok(());
            }
            cursor = page.next.cursor;
        }
    }

    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        username: &str,
        cursor: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<serde_json::Value> {
        let call = self.keys.execute(username, |lease| {
            let upstream = Arc::clone(&self.upstream);
            let username = username.to_string();
            let cursor = cursor.map(str::to_string);
            async move {
                upstream
                    .fetch_page(endpoint, &username, cursor.as_deref(), lease.key.secret())
                    .await
            }
        });

        let Some(deadline) = deadline else {
            return call.await;
        };
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), call).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::BudgetExhausted(self.config.account_budget)),
        }
    }

    /// Store one page. Returns true once the page reaches past the
    /// incremental cutoff (listings are newest first).
    async fn reconcile(
        &self,
        task: &FetchTask,
        endpoint: Endpoint,
        items: Vec<RawPost>,
        cutoff: Option<DateTime<Utc>>,
        fetched_at: DateTime<Utc>,
        report: &mut AccountReport,
    ) -> Result<bool> {
        let username = &task.account.username;
        let mut oldest: Option<DateTime<Utc>> = None;

        for raw in items {
            let resolution = timestamp::resolve(&raw, fetched_at, self.config.clock_skew);
            if resolution.is_unresolved() {
                warn!(
                    username = %username,
                    post_id = %raw.id,
                    rejected = ?resolution.rejected,
                    "No usable timestamp, falling back to fetch time"
                );
            } else {
                debug!(
                    username = %username,
                    post_id = %raw.id,
                    source = ?resolution.source,
                    rejected = ?resolution.rejected,
                    instant = %resolution.instant,
                    "Resolved timestamp"
                );
                oldest = Some(oldest.map_or(resolution.instant, |o| o.min(resolution.instant)));

                if let Some(cutoff) = cutoff {
                    if resolution.instant < cutoff {
                        report.older_than_cutoff += 1;
                        continue;
                    }
                }
            }

            let post = Post::from_raw(username, raw, endpoint, &resolution, fetched_at);
            let snapshot = EngagementSnapshot::of(&post, fetched_at);
            let unresolved = post.timestamp_unresolved();
            let permalink = post.permalink();

            match self.store.upsert_post(post).await? {
                UpsertOutcome::Created => {
                    debug!(username = %username, post = %permalink, "New post");
                    report.posts_created += 1;
                    POSTS_CREATED.inc();
                }
                UpsertOutcome::Updated => {
                    report.posts_updated += 1;
                    POSTS_UPDATED.inc();
                }
            }
            if unresolved {
                report.unresolved_timestamps += 1;
                UNRESOLVED_TIMESTAMPS.inc();
            }
            self.store.append_snapshot(snapshot).await?;
        }

        Ok(matches!((cutoff, oldest), (Some(c), Some(o)) if o < c))
    }
}
