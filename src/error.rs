use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FetchError>;

// Outcome of a single upstream call made with one key
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    // auth rejected or quota hit, the key goes on cooldown
    #[error("Key rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Account not found")]
    NotFound,

    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Errors that should take the key out of rotation for a while.
    pub fn is_key_fault(&self) -> bool {
        matches!(self, UpstreamError::Rejected { .. })
    }

    /// Errors worth retrying on a different key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Rejected { .. } | UpstreamError::Http { .. } | UpstreamError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Snapshot(err.to_string())
    }
}

// Task level failure for one account
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("All API keys at their rate cap after {rounds} rounds")]
    RateLimitExhausted { rounds: u32 },

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Account not found upstream: {0}")]
    AccountNotFound(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Account budget of {0:?} exhausted")]
    BudgetExhausted(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Fetch task crashed: {0}")]
    Crashed(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl FetchError {
    /// Short label used for metrics and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RateLimitExhausted { .. } => "rate_limit_exhausted",
            FetchError::UpstreamUnavailable(_) => "upstream_unavailable",
            FetchError::AccountNotFound(_) => "account_not_found",
            FetchError::MalformedResponse(_) => "malformed_response",
            FetchError::BudgetExhausted(_) => "budget_exhausted",
            FetchError::Cancelled => "cancelled",
            FetchError::Crashed(_) => "crashed",
            FetchError::Store(_) => "store",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("At least one API key required")]
    NoApiKeys,

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rejections_are_key_faults() {
        let rejected = UpstreamError::Rejected {
            status: 429,
            message: "quota".into(),
        };
        assert!(rejected.is_key_fault());
        assert!(rejected.is_retryable());

        let transport = UpstreamError::Transport("timeout".into());
        assert!(!transport.is_key_fault());
        assert!(transport.is_retryable());

        assert!(!UpstreamError::NotFound.is_retryable());
        assert!(!UpstreamError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_fetch_error_kind() {
        assert_eq!(
            FetchError::RateLimitExhausted { rounds: 3 }.kind(),
            "rate_limit_exhausted"
        );
        let err: FetchError = StoreError::UnknownAccount("nasa".into()).into();
        assert_eq!(err.kind(), "store");
    }
}
