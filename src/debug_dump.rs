use chrono::Utc;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::DebugDumpConfig;
use crate::models::Endpoint;

// Keeps the last N raw upstream responses per endpoint on disk
pub struct ResponseRecorder {
    dir: PathBuf,
    max_files: usize,
    seq: AtomicU64,
}

impl ResponseRecorder {
    pub fn new(config: &DebugDumpConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            max_files: config.max_files.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Write one response. Failures are logged and otherwise ignored.
    pub async fn record(&self, endpoint: Endpoint, username: &str, body: &Value) {
        if let Err(e) = self.try_record(endpoint, username, body).await {
            warn!(endpoint = endpoint.as_str(), username, error = %e, "Failed to save debug response");
        }
    }

    async fn try_record(&self, endpoint: Endpoint, username: &str, body: &Value) -> io::Result<()> {
        let dir = self.dir.join(endpoint.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        // millis first so names sort oldest-first, seq breaks ties
        let name = format!(
            "{:013}_{:06}_{}.json",
            Utc::now().timestamp_millis(),
            self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000,
            sanitize(username)
        );
        let pretty = serde_json::to_vec_pretty(body).map_err(io::Error::other)?;
        tokio::fs::write(dir.join(&name), pretty).await?;
        debug!(file = %name, "Saved debug response");

        let evicted = evict_oldest(&dir, self.max_files).await?;
        if evicted > 0 {
            debug!(endpoint = endpoint.as_str(), evicted, "Evicted old debug responses");
        }
        Ok(())
    }
}

fn sanitize(username: &str) -> String {
    username
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect()
}

async fn evict_oldest(dir: &Path, keep: usize) -> io::Result<usize> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            files.push(path);
        }
    }
    if files.len() <= keep {
        return Ok(0);
    }

    files.sort();
    let excess = files.len() - keep;
    for path in &files[..excess] {
        match tokio::fs::remove_file(path).await {
            // another worker evicted it first
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            other => other?,
        }
    }
    Ok(excess)
}
