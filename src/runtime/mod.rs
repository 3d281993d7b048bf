pub mod engine;
pub mod error;
pub mod instance;
pub mod redis_storage;
pub mod scheduler;
pub mod storage;
pub mod token;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in epoch milliseconds (UTC).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
