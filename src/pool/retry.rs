//! 重试退避策略
//!
//! 第 n 次重试前等待 min(base × 2^(n-1), max)，叠加 ±25% 抖动避免群发。

use std::time::Duration;

use rand::Rng;

/// 指数退避 + 抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// 第 `retry_index` 次重试（1 起）前的等待时间
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let exp = retry_index.saturating_sub(1).min(31);
        let raw = self.base_delay.as_secs_f64() * (1u64 << exp) as f64;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64() * 1.25))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}
