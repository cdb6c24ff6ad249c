use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram,
};


lazy_static! {
    pub static ref UPSTREAM_CALLS: Counter =
        register_counter!("instagram_upstream_calls_total", "Total upstream API calls issued").unwrap();
    pub static ref KEY_REJECTIONS: Counter =
        register_counter!("instagram_key_rejections_total", "Calls rejected for auth or quota").unwrap();
    pub static ref RATE_LIMIT_DEFERRALS: Counter = register_counter!(
        "instagram_rate_limit_deferrals_total",
        "Times every key was at its cap and the caller backed off"
    )
    .unwrap();
    pub static ref KEYS_COOLING_DOWN: Gauge =
        register_gauge!("instagram_keys_cooling_down", "API keys currently out of rotation").unwrap();
    pub static ref PAGES_FETCHED: Counter =
        register_counter!("instagram_pages_fetched_total", "Listing pages fetched").unwrap();
    pub static ref PAGES_SKIPPED: Counter =
        register_counter!("instagram_pages_skipped_total", "Malformed listing pages skipped").unwrap();
    pub static ref POSTS_CREATED: Counter =
        register_counter!("instagram_posts_created_total", "Posts stored for the first time").unwrap();
    pub static ref POSTS_UPDATED: Counter =
        register_counter!("instagram_posts_updated_total", "Posts refreshed by a later fetch").unwrap();
    pub static ref UNRESOLVED_TIMESTAMPS: Counter = register_counter!(
        "instagram_unresolved_timestamps_total",
        "Posts stored with the fetch-time fallback"
    )
    .unwrap();
    pub static ref TASK_OUTCOMES: CounterVec = register_counter_vec!(
        "instagram_fetch_tasks_total",
        "Account fetch tasks by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref ACCOUNT_FETCH_LATENCY: Histogram = register_histogram!(
        "instagram_account_fetch_seconds",
        "Wall-clock time of one account task"
    )
    .unwrap();
}

// Render the default registry in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
