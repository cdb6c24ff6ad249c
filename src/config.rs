use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "instagram-fetcher")]
#[command(about = "Rate limited Instagram post and reel fetcher")]
pub struct Args {
    // Where accounts and posts are kept between runs
    #[arg(long, env = "FETCHER_STATE", default_value = "instagram_state.json", global = true)]
    pub state: PathBuf,

    // RapidAPI keys (comma-separated)
    // Example: "key-one,key-two"
    #[arg(long, env = "RAPIDAPI_KEYS", default_value = "", hide_env_values = true, global = true)]
    pub api_keys: String,

    #[arg(long, env = "RAPIDAPI_HOST", default_value = "instagram120.p.rapidapi.com", global = true)]
    pub api_host: String,

    // Defaults to https://<api_host>
    #[arg(long, env = "RAPIDAPI_BASE_URL", global = true)]
    pub base_url: Option<String>,

    // Calls allowed per key in one window
    #[arg(long, default_value_t = 2, global = true)]
    pub calls_per_window: usize,

    // Window length in milliseconds
    #[arg(long, default_value_t = 1000, global = true)]
    pub rate_window_ms: u64,

    // How many times to wait for a free key before giving up
    #[arg(long, default_value_t = 20, global = true)]
    pub acquire_rounds: u32,

    #[arg(long, default_value_t = 100, global = true)]
    pub backoff_ms: u64,

    // Seconds a rejected key stays out of rotation
    #[arg(long, default_value_t = 60, global = true)]
    pub key_cooldown: u64,

    // Per-call HTTP timeout in seconds
    #[arg(long, default_value_t = 30, global = true)]
    pub request_timeout: u64,

    #[arg(long, default_value_t = 48, global = true)]
    pub incremental_hours: i64,

    #[arg(long, default_value_t = 300, global = true)]
    pub clock_skew_secs: i64,

    // Wall-clock budget per account task in seconds
    #[arg(long, default_value_t = 600, global = true)]
    pub account_budget: u64,

    #[arg(long, default_value_t = 10, global = true)]
    pub workers: usize,

    #[arg(long, env = "SKIP_REELS_ENDPOINT", global = true)]
    pub skip_reels: bool,

    #[arg(long, env = "DEBUG_SAVE_RESPONSES", global = true)]
    pub debug_save_responses: bool,

    #[arg(long, env = "DEBUG_RESPONSE_DIR", default_value = "debug_responses", global = true)]
    pub debug_response_dir: PathBuf,

    #[arg(long, env = "DEBUG_MAX_RESPONSE_FILES", default_value_t = 50, global = true)]
    pub debug_max_response_files: usize,

    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch posts and reels once for every registered account
    Fetch {
        // Ignore last fetch times and refetch everything
        #[arg(long)]
        full: bool,

        // Limit the run to these accounts
        #[arg(long = "account")]
        accounts: Vec<String>,
    },
    /// Register an account to monitor
    AddAccount { username: String },
    /// Re-derive fallback timestamps from post ids
    RepairTimestamps,
    /// Run the periodic scheduler with health and metrics endpoints
    Serve {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        #[arg(long, default_value_t = 8)]
        interval_hours: u64,
    },
}

#[derive(Debug, Clone)]
pub struct DebugDumpConfig {
    pub dir: PathBuf,
    pub max_files: usize,
}

// Everything the fetch engine needs, passed explicitly into constructors
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub api_keys: Vec<String>,
    pub api_host: String,
    pub base_url: String,
    pub calls_per_window: usize,
    pub rate_window: Duration,
    pub acquire_rounds: u32,
    pub backoff: Duration,
    pub key_cooldown: Duration,
    pub request_timeout: Duration,
    pub incremental_window: chrono::Duration,
    pub clock_skew: chrono::Duration,
    pub account_budget: Duration,
    pub workers: usize,
    pub include_reels: bool,
    pub debug_dump: Option<DebugDumpConfig>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            api_host: "instagram120.p.rapidapi.com".to_string(),
            base_url: "https://instagram120.p.rapidapi.com".to_string(),
            calls_per_window: 2,
            rate_window: Duration::from_secs(1),
            acquire_rounds: 20,
            backoff: Duration::from_millis(100),
            key_cooldown: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            incremental_window: chrono::Duration::hours(48),
            clock_skew: chrono::Duration::minutes(5),
            account_budget: Duration::from_secs(600),
            workers: 10,
            include_reels: true,
            debug_dump: None,
        }
    }
}

// Split "a, b,,c" into unique trimmed keys, keeping order
pub fn parse_api_keys(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

// Upper bounds that keep instant arithmetic far from overflow
const MAX_INCREMENTAL_HOURS: i64 = 24 * 365 * 10;
const MAX_CLOCK_SKEW_SECS: i64 = 24 * 3600;
const MAX_ACCOUNT_BUDGET_SECS: i64 = 7 * 24 * 3600;

fn bounded(name: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name,
            reason: format!("{} is outside {}..={}", value, min, max),
        })
    }
}

impl TryFrom<&Args> for FetchConfig {
    type Error = ConfigError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        let api_keys = parse_api_keys(&args.api_keys);
        if api_keys.is_empty() {
            return Err(ConfigError::NoApiKeys);
        }
        if args.calls_per_window == 0 {
            return Err(ConfigError::Invalid {
                name: "calls_per_window",
                reason: "must be at least 1".to_string(),
            });
        }
        if args.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "workers",
                reason: "must be at least 1".to_string(),
            });
        }

        if args.rate_window_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "rate_window_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        let incremental_hours = bounded("incremental_hours", args.incremental_hours, 1, MAX_INCREMENTAL_HOURS)?;
        let clock_skew_secs = bounded("clock_skew_secs", args.clock_skew_secs, 0, MAX_CLOCK_SKEW_SECS)?;
        let account_budget = bounded(
            "account_budget",
            i64::try_from(args.account_budget).unwrap_or(i64::MAX),
            1,
            MAX_ACCOUNT_BUDGET_SECS,
        )?;

        let base_url = args
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", args.api_host));

        Ok(Self {
            api_keys,
            api_host: args.api_host.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            calls_per_window: args.calls_per_window,
            rate_window: Duration::from_millis(args.rate_window_ms),
            acquire_rounds: args.acquire_rounds.max(1),
            backoff: Duration::from_millis(args.backoff_ms),
            key_cooldown: Duration::from_secs(args.key_cooldown),
            request_timeout: Duration::from_secs(args.request_timeout),
            incremental_window: chrono::Duration::hours(incremental_hours),
            clock_skew: chrono::Duration::seconds(clock_skew_secs),
            account_budget: Duration::from_secs(account_budget as u64),
            workers: args.workers,
            include_reels: !args.skip_reels,
            debug_dump: args.debug_save_responses.then(|| DebugDumpConfig {
                dir: args.debug_response_dir.clone(),
                max_files: args.debug_max_response_files,
            }),
        })
    }
}
