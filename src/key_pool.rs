use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::error::{ConfigError, FetchError, UpstreamError};
use crate::metrics::{KEY_REJECTIONS, KEYS_COOLING_DOWN, RATE_LIMIT_DEFERRALS, UPSTREAM_CALLS};
use crate::rate_limit::RateLimiter;

// Single API key

pub struct ApiKey {
    secret: String,
    pub fingerprint: String, // safe to log
}

impl ApiKey {
    pub fn new(secret: String) -> Self {
        let fingerprint = fingerprint(&secret);
        Self { secret, fingerprint }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

// Short hash of the key (first 12 hex chars of sha256)
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

/// A key that has been admitted by the rate limiter for exactly one call.
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub index: usize,
    pub key: Arc<ApiKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    // every usable key is at its cap right now
    AtCapacity,
    AllCoolingDown,
}

// Key pool with rotation, rate limiting and failure cooldown

pub struct KeyPool {
    keys: Vec<Arc<ApiKey>>,
    current: AtomicUsize,
    limiter: RateLimiter,
    cooldowns: DashMap<usize, Instant>, // key index -> back in rotation at
    cooldown: Duration,
    acquire_rounds: u32,
    backoff: Duration,
}

impl KeyPool {
    pub fn new(config: &FetchConfig) -> Result<Self, ConfigError> {
        let keys: Vec<Arc<ApiKey>> = config
            .api_keys
            .iter()
            .map(|secret| Arc::new(ApiKey::new(secret.clone())))
            .collect();
        if keys.is_empty() {
            return Err(ConfigError::NoApiKeys);
        }

        let limiter = RateLimiter::new(config.calls_per_window, config.rate_window);
        info!(
            keys = keys.len(),
            cap = limiter.max_calls(),
            window = ?limiter.window(),
            "Key pool initialized"
        );
        for (i, k) in keys.iter().enumerate() {
            debug!(index = i, key = %k.fingerprint, "Registered API key");
        }

        Ok(Self {
            keys,
            current: AtomicUsize::new(0),
            limiter,
            cooldowns: DashMap::new(),
            cooldown: config.key_cooldown,
            acquire_rounds: config.acquire_rounds,
            backoff: config.backoff,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn acquire(&self) -> Result<KeyLease, Unavailable> {
        self.acquire_at(Instant::now())
    }

    /// Next key (round-robin from a moving start) that is not cooling down
    /// and still has room in its window.
    pub fn acquire_at(&self, now: Instant) -> Result<KeyLease, Unavailable> {
        let len = self.keys.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;
        let mut cooling = 0;

        for i in 0..len {
            let idx = (start + i) % len;
            if self.is_cooling_down(idx, now) {
                cooling += 1;
                continue;
            }

            let key = &self.keys[idx];
            if self.limiter.admit_at(&key.fingerprint, now) {
                return Ok(KeyLease {
                    index: idx,
                    key: Arc::clone(key),
                });
            }
        }

        if cooling == len {
            Err(Unavailable::AllCoolingDown)
        } else {
            Err(Unavailable::AtCapacity)
        }
    }

    fn is_cooling_down(&self, idx: usize, now: Instant) -> bool {
        let until = match self.cooldowns.get(&idx) {
            Some(entry) => *entry,
            None => return false,
        };
        if until > now {
            return true;
        }
        // expired, put the key back
        if self.cooldowns.remove_if(&idx, |_, until| *until <= now).is_some() {
            KEYS_COOLING_DOWN.set(self.cooldowns.len() as f64);
            info!(key = %self.keys[idx].fingerprint, "API key back in rotation");
        }
        false
    }

    pub fn mark_failed(&self, idx: usize) {
        self.mark_failed_at(idx, Instant::now());
    }

    pub fn mark_failed_at(&self, idx: usize, now: Instant) {
        self.cooldowns.insert(idx, now + self.cooldown);
        KEYS_COOLING_DOWN.set(self.cooldowns.len() as f64);
        warn!(
            key = %self.keys[idx].fingerprint,
            cooldown = ?self.cooldown,
            "API key marked failed"
        );
    }

    pub fn cooling_down(&self) -> usize {
        let now = Instant::now();
        (0..self.keys.len())
            .filter(|idx| self.is_cooling_down(*idx, now))
            .count()
    }

    /// Poll for a key, sleeping between rounds while every key is at cap.
    pub async fn acquire_with_backoff(&self) -> Result<KeyLease, FetchError> {
        for round in 0..self.acquire_rounds {
            match self.acquire() {
                Ok(lease) => return Ok(lease),
                Err(Unavailable::AllCoolingDown) => {
                    return Err(FetchError::UpstreamUnavailable(
                        "every API key is cooling down".to_string(),
                    ));
                }
                Err(Unavailable::AtCapacity) => {
                    RATE_LIMIT_DEFERRALS.inc();
                    debug!(round, backoff = ?self.backoff, "All keys at cap, backing off");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
        Err(FetchError::RateLimitExhausted {
            rounds: self.acquire_rounds,
        })
    }

    /// Run one upstream call, moving to another key when a key fails.
    /// `subject` names what is being fetched, for errors and logs.
    pub async fn execute<T, F, Fut>(&self, subject: &str, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut(KeyLease) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut failures = 0;
        let mut last_error: Option<UpstreamError> = None;

        while failures < self.keys.len() {
            let lease = match self.acquire_with_backoff().await {
                Ok(lease) => lease,
                Err(FetchError::UpstreamUnavailable(reason)) => {
                    let reason = match &last_error {
                        Some(e) => format!("{} (last error: {})", reason, e),
                        None => reason,
                    };
                    return Err(FetchError::UpstreamUnavailable(reason));
                }
                Err(e) => return Err(e),
            };
            UPSTREAM_CALLS.inc();

            match call(lease.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    return Err(match e {
                        UpstreamError::NotFound => FetchError::AccountNotFound(subject.to_string()),
                        UpstreamError::Decode(reason) => FetchError::MalformedResponse(reason),
                        other => FetchError::UpstreamUnavailable(other.to_string()),
                    });
                }
                Err(e) => {
                    failures += 1;
                    if e.is_key_fault() {
                        KEY_REJECTIONS.inc();
                        self.mark_failed(lease.index);
                    } else {
                        warn!(
                            subject,
                            key = %lease.key.fingerprint,
                            error = %e,
                            "Upstream call failed, retrying on another key"
                        );
                        tokio::time::sleep(self.backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(FetchError::UpstreamUnavailable(format!(
            "{} key attempts failed for {}, last error: {}",
            failures, subject, last
        )))
    }
}
