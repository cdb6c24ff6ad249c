use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use instagram_fetcher::config::{Args, Command, FetchConfig};
use instagram_fetcher::handlers;
use instagram_fetcher::key_pool::KeyPool;
use instagram_fetcher::models::normalize_username;
use instagram_fetcher::scheduler::fetch_scheduler;
use instagram_fetcher::state::AppState;
use instagram_fetcher::store::{MemoryStore, PostStore};
use instagram_fetcher::upstream::RapidApiClient;
use instagram_fetcher::{BatchControl, Fetcher, run_batch};

#[tokio::main]
async fn main() -> Result<()> {
    // parse cli arguments
    let args = Args::parse();
    init_tracing(args.log_json)?;

    let store = Arc::new(
        MemoryStore::load(&args.state)
            .with_context(|| format!("Failed to load state from {}", args.state.display()))?,
    );

    match args.command.clone() {
        Command::AddAccount { username } => {
            if store.add_account(&username)? {
                info!(username = %normalize_username(&username), "Account added");
            } else {
                info!(username = %normalize_username(&username), "Account already tracked");
            }
            store.save(&args.state)?;
        }

        Command::RepairTimestamps => {
            let (fixed, failed) = store.repair_timestamps(Utc::now());
            info!(fixed, still_unresolved = failed, "Timestamp repair done");
            store.save(&args.state)?;
        }

        Command::Fetch { full, accounts } => {
            let fetcher = build_fetcher(&args, Arc::clone(&store))?;

            let mut tracked = store.accounts().await?;
            if !accounts.is_empty() {
                let wanted: HashSet<String> = accounts.iter().map(|a| normalize_username(a)).collect();
                for name in &wanted {
                    if !tracked.iter().any(|a| &a.username == name) {
                        warn!(username = %name, "Not a tracked account, skipping");
                    }
                }
                tracked.retain(|a| wanted.contains(&a.username));
            }

            // Ctrl-C stops every account before its next page
            let control = Arc::new(BatchControl::new());
            let interrupt = Arc::clone(&control);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling remaining work");
                    interrupt.cancel_all();
                }
            });

            let total = tracked.len();
            let report = run_batch(fetcher, tracked, full, control).await;
            store.save(&args.state)?;

            if report.failed() > 0 {
                anyhow::bail!("{} of {} accounts failed", report.failed(), total);
            }
        }

        Command::Serve { port, interval_hours } => {
            let fetcher = build_fetcher(&args, Arc::clone(&store))?;
            let state = Arc::new(AppState::new(fetcher, Arc::clone(&store), args.state.clone()));

            let every = Duration::from_secs(interval_hours.max(1) * 3600);
            tokio::spawn(fetch_scheduler(Arc::clone(&state), every));

            let app = handlers::router(state);
            let addr = format!("0.0.0.0:{}", port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;

            info!(port, interval_hours, "Fetcher running on http://localhost:{}", port);
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("instagram_fetcher=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn build_fetcher(args: &Args, store: Arc<MemoryStore>) -> Result<Arc<Fetcher>> {
    let config = FetchConfig::try_from(args)?;
    let keys = KeyPool::new(&config)?;
    let client = RapidApiClient::new(&config)?;

    info!(
        keys = keys.len(),
        calls_per_window = config.calls_per_window,
        window = ?config.rate_window,
        workers = config.workers,
        include_reels = config.include_reels,
        "Fetcher configured"
    );

    Ok(Arc::new(Fetcher::new(
        config,
        Arc::new(keys),
        Arc::new(client),
        store as Arc<dyn PostStore>,
    )))
}
