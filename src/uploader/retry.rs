// 重试策略
//
// 失败处理时同步调用，不产生任何副作用：
// - 不可重试错误（服务器明确拒绝）立即放弃
// - 尝试次数未达上限时重试，可选指数退避
// - 否则放弃，条目停留在 Failed

use crate::config::UploadConfig;
use crate::transport::TransferError;
use std::fmt;
use std::time::Duration;

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 默认最大退避延迟（毫秒）
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 重新入队；`delay` 为零时立即追加到等待队列末尾
    Retry { delay: Duration },
    /// 放弃，条目停留在 Failed
    GiveUp,
}

/// 重试策略
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// 根据已尝试次数和最近一次错误决定是否重试
    fn decide(&self, attempt_count: u32, error: &TransferError) -> RetryDecision;
}

/// 默认重试策略
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    max_backoff: Duration,
}

impl DefaultRetryPolicy {
    /// 立即重试（无退避）
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }

    /// 设置指数退避参数
    pub fn with_backoff(mut self, backoff: Duration, max_backoff: Duration) -> Self {
        self.backoff = backoff;
        self.max_backoff = max_backoff;
        self
    }

    /// 从上传配置创建
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_attempts).with_backoff(
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 计算指数退避延迟
    ///
    /// # 延迟序列（backoff = 500ms）
    /// - attempt=1: 500ms
    /// - attempt=2: 1000ms
    /// - attempt=3: 2000ms
    /// - 最大: max_backoff
    fn backoff_delay(&self, attempt_count: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt_count.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_backoff)
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, attempt_count: u32, error: &TransferError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if attempt_count < self.max_attempts {
            RetryDecision::Retry {
                delay: self.backoff_delay(attempt_count),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> TransferError {
        TransferError::transient("连接被重置")
    }

    #[test]
    fn test_retry_until_max_attempts() {
        let policy = DefaultRetryPolicy::new(3);

        assert_eq!(
            policy.decide(1, &transient()),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            policy.decide(2, &transient()),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );
        assert_eq!(policy.decide(3, &transient()), RetryDecision::GiveUp);
        assert_eq!(policy.decide(7, &transient()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_rejected_error_gives_up_immediately() {
        let policy = DefaultRetryPolicy::new(10);
        let error = TransferError::rejected("文件类型不允许");
        assert_eq!(policy.decide(1, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = DefaultRetryPolicy::new(10)
            .with_backoff(Duration::from_millis(500), Duration::from_millis(3000));

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(3000)); // 超过最大值
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_default_policy() {
        let policy = DefaultRetryPolicy::default();
        assert_eq!(policy.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(policy.backoff_delay(2), Duration::ZERO);
    }
}
