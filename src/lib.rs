pub mod config;
pub mod debug_dump;
pub mod error;
pub mod handlers;
pub mod key_pool;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parse;
pub mod rate_limit;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod timestamp;
pub mod upstream;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{FetchError, Result};
pub use orchestrator::{AccountReport, CancelFlag, FetchState, Fetcher};
pub use worker::{BatchControl, BatchReport, run_batch};
