use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::info;

use crate::state::AppState;

// Periodic fetch, first run right away. A tick that lands while a batch is
// still running is skipped, not queued.
pub async fn fetch_scheduler(state: Arc<AppState>, every: Duration) {
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval = ?every, "Fetch scheduler started");

    loop {
        interval.tick().await;

        if let Some(report) = state.run_once(false).await {
            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "Scheduled fetch finished"
            );
        }
    }
}
