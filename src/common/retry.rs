// 重试策略
//
// 离线队列回放和上传会话共用同一套有界重试判断：
// - 失败次数 <= 最大重试次数：继续重试
// - 失败次数 > 最大重试次数：放弃
//
// 退避延迟沿用指数退避：100ms 起步，每次翻倍，上限 5000ms

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 初始退避延迟（毫秒）
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
pub const MAX_BACKOFF_MS: u64 = 5000;

/// 重试判断结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 继续重试，等待 `delay` 后再发起
    Retry { delay: Duration },
    /// 放弃
    GiveUp,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// 有界重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避延迟（毫秒）
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// 创建指定重试次数的策略（退避参数使用默认值）
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::with_max_retries(0)
    }

    /// 按策略自身的上限判断是否重试
    ///
    /// # 参数
    /// * `failures` - 截至目前已失败的次数（含本次）
    /// * `retriable` - 本次错误是否允许重试
    pub fn decide(&self, failures: u32, retriable: bool) -> RetryDecision {
        self.decide_with_limit(failures, self.max_retries, retriable)
    }

    /// 按调用方给定的上限判断是否重试
    ///
    /// 队列中的每条操作都带有自己的 `max_retries`，回放时用它覆盖策略默认值
    pub fn decide_with_limit(&self, failures: u32, max_retries: u32, retriable: bool) -> RetryDecision {
        if !retriable || failures > max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff_delay(failures.saturating_sub(1)),
        }
    }

    /// 计算指数退避延迟
    ///
    /// # 延迟序列（默认参数）
    /// - retry_index=0: 100ms
    /// - retry_index=1: 200ms
    /// - retry_index=2: 400ms
    /// - retry_index=3: 800ms
    /// - 最大: 5000ms
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_index).unwrap_or(u64::MAX);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// 是否已耗尽（失败次数超过上限）
    pub fn is_exhausted(&self, failures: u32, max_retries: u32) -> bool {
        failures > max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
        // 超过最大值
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_decide_bounded() {
        let policy = RetryPolicy::with_max_retries(2);

        assert!(policy.decide(1, true).should_retry());
        assert!(policy.decide(2, true).should_retry());
        assert_eq!(policy.decide(3, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_not_retriable() {
        let policy = RetryPolicy::with_max_retries(5);
        assert_eq!(policy.decide(1, false), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_with_item_limit() {
        let policy = RetryPolicy::default();

        // 单条操作的上限优先于策略默认值
        assert!(policy.decide_with_limit(1, 1, true).should_retry());
        assert_eq!(policy.decide_with_limit(2, 1, true), RetryDecision::GiveUp);
        assert!(policy.is_exhausted(2, 1));
        assert!(!policy.is_exhausted(1, 1));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.decide(1, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_delay_follows_failures() {
        let policy = RetryPolicy::with_max_retries(3);
        assert_eq!(
            policy.decide(1, true),
            RetryDecision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(3, true),
            RetryDecision::Retry {
                delay: Duration::from_millis(400)
            }
        );
    }
}
