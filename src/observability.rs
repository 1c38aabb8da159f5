//! 可观测性
//!
//! tracing 初始化与引擎级指标：外部调用次数 / 失败数 / token 消耗 / 任务终态计数。

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 引擎指标收集器
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub invocations: AtomicU64,
    pub invocation_failures: AtomicU64,
    pub tokens_used: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_blocked: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取全局指标实例
    pub fn global() -> &'static EngineMetrics {
        static INSTANCE: std::sync::OnceLock<EngineMetrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(EngineMetrics::new)
    }

    pub fn record_invocation(&self, success: bool, tokens: u64) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.invocation_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.tokens_used.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.invocations.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.invocation_failures.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// 导出为 JSON（诊断用）
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "invocations": self.invocations.load(Ordering::Relaxed),
            "invocation_failures": self.invocation_failures.load(Ordering::Relaxed),
            "tokens_used": self.tokens_used.load(Ordering::Relaxed),
            "tasks_completed": self.tasks_completed.load(Ordering::Relaxed),
            "tasks_failed": self.tasks_failed.load(Ordering::Relaxed),
            "tasks_blocked": self.tasks_blocked.load(Ordering::Relaxed),
            "error_rate": self.error_rate(),
        })
    }
}
