//! 每执行器熔断器
//!
//! CLOSED 正常计数连续瞬态失败；达到阈值进入 OPEN，冷却期内拒绝接活；
//! 冷却结束进入 HALF_OPEN 放行一次探测，成功回 CLOSED，失败回 OPEN 且
//! 冷却时间翻倍（封顶 max_cooldown）。熔断器按执行器隔离，不是全局开关。

use std::time::{Duration, Instant};

/// 熔断器参数
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// `check()` 的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// 可以接活（CLOSED，或 HALF_OPEN 的那一次探测）
    Ready,
    /// 冷却中，直到给定时刻
    OpenUntil(Instant),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_until: Option<Instant>,
    current_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let current_cooldown = config.open_cooldown;
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            open_until: None,
            current_cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// 接活前询问；OPEN 冷却到期时自动转 HALF_OPEN
    pub fn check(&mut self) -> Availability {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Availability::Ready,
            BreakerState::Open => {
                let until = self.open_until.expect("open breaker carries a deadline");
                if Instant::now() >= until {
                    self.state = BreakerState::HalfOpen;
                    Availability::Ready
                } else {
                    Availability::OpenUntil(until)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == BreakerState::HalfOpen {
            // 探测成功，恢复正常并重置冷却
            self.current_cooldown = self.config.open_cooldown;
        }
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.open_until = None;
    }

    /// 记一次瞬态失败；返回是否因此进入 OPEN
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::HalfOpen => {
                // 探测失败，冷却翻倍
                self.current_cooldown =
                    (self.current_cooldown * 2).min(self.config.max_cooldown);
                self.trip();
                true
            }
            BreakerState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip();
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        let now = Instant::now();
        self.opened_at = Some(now);
        self.open_until = Some(now + self.current_cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            open_cooldown: Duration::from_millis(10),
            max_cooldown: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let mut breaker = CircuitBreaker::new(fast_config());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.check(), Availability::Ready);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.check(), Availability::OpenUntil(_)));
    }

    #[test]
    fn test_half_open_after_cooldown_then_close_on_success() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.check(), Availability::Ready);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_probe_failure_doubles_cooldown() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.check(), Availability::Ready); // HALF_OPEN 探测

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.current_cooldown, Duration::from_millis(20));

        // 再探测再失败，封顶 max_cooldown
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.check(), Availability::Ready);
        breaker.record_failure();
        assert_eq!(breaker.current_cooldown, Duration::from_millis(40));
        std::thread::sleep(Duration::from_millis(45));
        assert_eq!(breaker.check(), Availability::Ready);
        breaker.record_failure();
        assert_eq!(breaker.current_cooldown, Duration::from_millis(40));
    }
}
