//! Token 预算治理
//!
//! 规划器入队前与执行器调用前都做准入检查；strict 模式下超限直接拒绝，
//! soft 模式放行但告警。告警事件整轮只发一次。工具上报多少 token 就记多少，
//! 引擎不自行推算。关闭时把用量快照写到任务存储旁边。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::BudgetSection;
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventSink};

/// 超限处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    Strict,
    Soft,
}

/// 用量快照（关闭时持久化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tokens_used: u64,
    pub total_limit: u64,
    pub per_task: HashMap<String, u64>,
    /// 本轮统计起点（毫秒时间戳）
    pub started_at: i64,
}

/// 预算治理器
pub struct BudgetGovernor {
    total_limit: u64,
    per_task_limit: u64,
    warning_threshold: u8,
    mode: EnforcementMode,
    tokens_used: AtomicU64,
    per_task: Mutex<HashMap<String, u64>>,
    warned: AtomicBool,
    started_at: i64,
    events: Arc<dyn EventSink>,
}

impl BudgetGovernor {
    pub fn new(section: &BudgetSection, events: Arc<dyn EventSink>) -> Self {
        let mode = match section.enforcement_mode.as_str() {
            "soft" => EnforcementMode::Soft,
            _ => EnforcementMode::Strict,
        };
        Self {
            total_limit: section.total_limit,
            per_task_limit: section.per_task_limit,
            warning_threshold: section.warning_threshold,
            mode,
            tokens_used: AtomicU64::new(0),
            per_task: Mutex::new(HashMap::new()),
            warned: AtomicBool::new(false),
            started_at: chrono::Utc::now().timestamp_millis(),
            events,
        }
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn total_limit(&self) -> u64 {
        self.total_limit
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    /// 单任务预估成本：配置了 per_task_limit 就用它，否则 0
    pub fn estimated_cost(&self) -> u64 {
        self.per_task_limit
    }

    /// 派发前准入检查
    ///
    /// strict：`used + estimated > limit` 即拒绝；soft：放行但发一次告警。
    pub fn admit(&self, estimated: u64) -> Result<(), EngineError> {
        if self.total_limit == 0 {
            return Ok(());
        }
        let used = self.tokens_used();
        if used + estimated <= self.total_limit {
            return Ok(());
        }
        match self.mode {
            EnforcementMode::Strict => Err(EngineError::BudgetExhausted {
                used,
                limit: self.total_limit,
            }),
            EnforcementMode::Soft => {
                self.warn_once(used);
                Ok(())
            }
        }
    }

    /// 成功调用后记账
    pub fn record(&self, task_id: &str, tokens: u64) {
        let used = self.tokens_used.fetch_add(tokens, Ordering::Relaxed) + tokens;
        {
            let mut per_task = self.per_task.lock().unwrap();
            *per_task.entry(task_id.to_string()).or_insert(0) += tokens;
        }
        if self.per_task_limit > 0 {
            let task_total = *self.per_task.lock().unwrap().get(task_id).unwrap_or(&0);
            if task_total > self.per_task_limit {
                tracing::warn!(
                    task_id = %task_id,
                    tokens = task_total,
                    limit = self.per_task_limit,
                    "task exceeded its per-task token limit"
                );
            }
        }
        if self.total_limit > 0 {
            let threshold = self.total_limit * self.warning_threshold as u64 / 100;
            if used >= threshold {
                self.warn_once(used);
            }
        }
    }

    fn warn_once(&self, used: u64) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            self.events.event(&EngineEvent::BudgetWarning {
                used,
                limit: self.total_limit,
            });
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            tokens_used: self.tokens_used(),
            total_limit: self.total_limit,
            per_task: self.per_task.lock().unwrap().clone(),
            started_at: self.started_at,
        }
    }

    /// 把用量快照写到给定路径（关闭流程调用）
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let raw = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| EngineError::Configuration(format!("budget snapshot: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path.as_ref(), raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::CollectingSink;

    fn section(total: u64, per_task: u64, mode: &str) -> BudgetSection {
        BudgetSection {
            total_limit: total,
            per_task_limit: per_task,
            warning_threshold: 80,
            enforcement_mode: mode.to_string(),
        }
    }

    #[test]
    fn test_unlimited_always_admits() {
        let governor = BudgetGovernor::new(&section(0, 0, "strict"), Arc::new(CollectingSink::new()));
        governor.record("t", 1_000_000);
        assert!(governor.admit(1_000_000).is_ok());
    }

    #[test]
    fn test_strict_denies_over_limit() {
        let governor =
            BudgetGovernor::new(&section(1000, 600, "strict"), Arc::new(CollectingSink::new()));
        assert!(governor.admit(600).is_ok());
        governor.record("first", 600);
        let err = governor.admit(600).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExhausted { used: 600, limit: 1000 }));
    }

    #[test]
    fn test_soft_admits_but_warns_once() {
        let sink = Arc::new(CollectingSink::new());
        let governor = BudgetGovernor::new(&section(100, 0, "soft"), sink.clone());
        governor.record("t", 200);
        assert!(governor.admit(50).is_ok());
        assert!(governor.admit(50).is_ok());

        let warnings = sink
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::BudgetWarning { .. }))
            .count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_warning_threshold_fires_once() {
        let sink = Arc::new(CollectingSink::new());
        let governor = BudgetGovernor::new(&section(1000, 0, "strict"), sink.clone());
        governor.record("a", 700);
        assert!(sink.events().is_empty());
        governor.record("b", 150); // 850 >= 800
        governor.record("c", 100);

        let warnings = sink
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::BudgetWarning { .. }))
            .count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_per_task_breakdown() {
        let governor = BudgetGovernor::new(&section(0, 0, "strict"), Arc::new(CollectingSink::new()));
        governor.record("a", 100);
        governor.record("a", 50);
        governor.record("b", 25);

        let snapshot = governor.snapshot();
        assert_eq!(snapshot.tokens_used, 175);
        assert_eq!(snapshot.per_task["a"], 150);
        assert_eq!(snapshot.per_task["b"], 25);
    }
}
