//! Scripted upstream and listing builders for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::UpstreamError;
use crate::models::Endpoint;
use crate::timestamp::SNOWFLAKE_EPOCH_MS;
use crate::upstream::Upstream;

type Script = Result<Value, UpstreamError>;
type PageKey = (Endpoint, String, Option<String>);

#[derive(Debug, Clone)]
pub struct Call {
    pub endpoint: Endpoint,
    pub username: String,
    pub cursor: Option<String>,
    pub api_key: String,
}

/// Upstream answering from scripted pages. Each (endpoint, username, cursor)
/// serves its queued responses in order and then repeats the last one.
/// Anything unscripted gets an empty listing.
#[derive(Default)]
pub struct MockUpstream {
    pages: Mutex<HashMap<PageKey, VecDeque<Script>>>,
    calls: Mutex<Vec<Call>>,
    latency: Option<Duration>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn page(&self, endpoint: Endpoint, username: &str, cursor: Option<&str>, response: Script) {
        let key = (endpoint, username.to_string(), cursor.map(str::to_string));
        self.pages
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(response);
    }

    /// Drop anything queued for this page and serve `response` from now on.
    pub fn replace(&self, endpoint: Endpoint, username: &str, cursor: Option<&str>, response: Script) {
        let key = (endpoint, username.to_string(), cursor.map(str::to_string));
        self.pages
            .lock()
            .unwrap()
            .insert(key, VecDeque::from([response]));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_with_cursor(&self, endpoint: Endpoint, cursor: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.endpoint == endpoint && c.cursor.as_deref() == Some(cursor))
            .count()
    }

    fn next_response(&self, key: &PageKey) -> Script {
        let mut pages = self.pages.lock().unwrap();
        match pages.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Ok(listing(Vec::new(), None)),
        }
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        username: &str,
        cursor: Option<&str>,
        api_key: &str,
    ) -> Result<Value, UpstreamError> {
        self.calls.lock().unwrap().push(Call {
            endpoint,
            username: username.to_string(),
            cursor: cursor.map(str::to_string),
            api_key: api_key.to_string(),
        });
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_response(&(endpoint, username.to_string(), cursor.map(str::to_string)))
    }
}

/// Listing node the way the upstream sends it.
pub fn node(id: &str, taken_at: Option<DateTime<Utc>>) -> Value {
    let mut node = json!({
        "pk": id,
        "code": format!("C{}", id),
        "media_type": 1,
        "like_count": 0,
        "comment_count": 0,
        "caption": {"text": format!("post {}", id)},
        "image_versions2": {"candidates": [{"url": format!("https://cdn.test/{}.jpg", id)}]},
    });
    if let Some(at) = taken_at {
        node["taken_at"] = json!(at.timestamp());
    }
    node
}

/// `{"result": {"edges": [...], "page_info": {...}}}`
pub fn listing(nodes: Vec<Value>, next_cursor: Option<&str>) -> Value {
    let edges: Vec<Value> = nodes.into_iter().map(|n| json!({"node": n})).collect();
    json!({
        "result": {
            "edges": edges,
            "page_info": {
                "has_next_page": next_cursor.is_some(),
                "end_cursor": next_cursor,
            }
        }
    })
}

/// Post id whose embedded creation time is `at`, to the millisecond.
pub fn snowflake_for(at: DateTime<Utc>) -> String {
    let millis = (at.timestamp_millis() - SNOWFLAKE_EPOCH_MS) as u64;
    (millis << 23).to_string()
}

/// Fast config for tests: `keys` keys, a generous cap and short waits.
pub fn test_config(keys: usize) -> FetchConfig {
    FetchConfig {
        api_keys: (0..keys).map(|i| format!("test-key-{}", i)).collect(),
        calls_per_window: 100,
        acquire_rounds: 50,
        backoff: Duration::from_millis(5),
        key_cooldown: Duration::from_secs(60),
        workers: 4,
        ..FetchConfig::default()
    }
}
