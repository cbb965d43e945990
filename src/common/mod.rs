//! 公共模块
//!
//! 提供离线队列和上传管线共用的组件

mod network;
mod retry;

pub use network::NetworkMonitor;
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};
