//! 引擎错误类型与重试分类
//!
//! 每个可失败操作返回带错误种类标签的 Result；种类决定重试 / 熔断 / 终止策略，
//! 任务记录中持久化的是 `ErrorKind` + 一行消息，完整错误留在日志。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::task::TaskStatus;

/// 错误种类标签（持久化到任务记录，驱动重试与退出码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 网络 / 限流 / 超时等瞬态失败
    Transient,
    /// 工具输出头不合约定
    Protocol,
    /// 声称产出的文件缺失或为空
    Validation,
    /// 依赖图成环
    DependencyCycle,
    /// 存储乐观并发冲突（内部，不对用户暴露）
    Conflict,
    /// Token 预算耗尽
    BudgetExhausted,
    /// 快照校验和不匹配
    CorruptCheckpoint,
    /// 快照超过陈旧阈值
    StaleCheckpoint,
    /// 配置非法
    Configuration,
    /// 用户中断 / 引擎关闭
    Cancelled,
}

impl ErrorKind {
    /// 该种类是否消耗一次重试后再入队
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Protocol | ErrorKind::Validation
        )
    }

    /// 该种类是否计入执行器熔断器的连续失败
    pub fn trips_breaker(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Protocol)
    }

    /// 允许的总尝试次数（max_retries 为重试数，首次尝试额外 +1）
    pub fn attempts_allowed(self, max_retries: u32) -> u32 {
        match self {
            ErrorKind::Transient | ErrorKind::Validation => max_retries + 1,
            // 协议错误收敛很快，限定两次尝试
            ErrorKind::Protocol => (max_retries + 1).min(2),
            _ => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Protocol => "protocol_error",
            ErrorKind::Validation => "validation_failure",
            ErrorKind::DependencyCycle => "dependency_cycle",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::CorruptCheckpoint => "corrupt_checkpoint",
            ErrorKind::StaleCheckpoint => "stale_checkpoint",
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed tool output: {0}")]
    Protocol(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("dependency cycle through tasks: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("token budget exhausted: {used} used of {limit}")]
    BudgetExhausted { used: u64, limit: u64 },

    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("stale checkpoint: {0}")]
    StaleCheckpoint(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid transition for task {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::DependencyCycle(_) => ErrorKind::DependencyCycle,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            EngineError::CorruptCheckpoint(_) => ErrorKind::CorruptCheckpoint,
            EngineError::StaleCheckpoint(_) => ErrorKind::StaleCheckpoint,
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::NotFound(_) => ErrorKind::Configuration,
            EngineError::InvalidTransition { .. } => ErrorKind::Conflict,
            // 未预期的 I/O 失败按瞬态走正常失败管道，绝不跨任务 panic
            EngineError::Io(_) => ErrorKind::Transient,
        }
    }

    /// 一行摘要，写入任务记录与下一次提示词的重试上下文
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Protocol.is_retryable());
        assert!(ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::DependencyCycle.is_retryable());
        assert!(!ErrorKind::Configuration.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_attempts_allowed() {
        assert_eq!(ErrorKind::Transient.attempts_allowed(3), 4);
        assert_eq!(ErrorKind::Validation.attempts_allowed(3), 4);
        // 协议错误限定两次尝试
        assert_eq!(ErrorKind::Protocol.attempts_allowed(3), 2);
        assert_eq!(ErrorKind::Protocol.attempts_allowed(0), 1);
        assert_eq!(ErrorKind::DependencyCycle.attempts_allowed(3), 1);
    }

    #[test]
    fn test_breaker_classification() {
        assert!(ErrorKind::Transient.trips_breaker());
        assert!(ErrorKind::Protocol.trips_breaker());
        assert!(!ErrorKind::Validation.trips_breaker());
        assert!(!ErrorKind::BudgetExhausted.trips_breaker());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EngineError::Transient("net".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            EngineError::BudgetExhausted { used: 10, limit: 5 }.kind(),
            ErrorKind::BudgetExhausted
        );
        let io = EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_kind_serde_round_trip() {
        let json = serde_json::to_string(&ErrorKind::StaleCheckpoint).unwrap();
        assert_eq!(json, "\"stale_checkpoint\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::StaleCheckpoint);
    }
}
