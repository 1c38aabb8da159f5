//! 事件与进度端口
//!
//! 终态事件走 `EventSink`（可接 webhook / 邮件等外部通知），状态迁移走
//! `ProgressSink`（可接终端进度渲染）。引擎默认都接 tracing。

use std::sync::Mutex;

use crate::core::error::ErrorKind;
use crate::store::task::TaskStatus;

/// 引擎终态事件
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskCompleted {
        task_id: String,
        tokens_used: u64,
    },
    TaskFailed {
        task_id: String,
        kind: ErrorKind,
        message: String,
    },
    TaskBlocked {
        task_id: String,
        blocked_on: String,
    },
    BudgetWarning {
        used: u64,
        limit: u64,
    },
    BudgetExhausted {
        used: u64,
        limit: u64,
    },
    ReviewEmitted {
        depth: u32,
        new_tasks: usize,
    },
    Shutdown {
        reason: String,
    },
}

/// 终态事件接收端口
pub trait EventSink: Send + Sync {
    fn event(&self, event: &EngineEvent);
}

/// 状态迁移观察端口
pub trait ProgressSink: Send + Sync {
    fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus);
}

/// 默认实现：全部落到 tracing
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::TaskCompleted {
                task_id,
                tokens_used,
            } => {
                tracing::info!(task_id = %task_id, tokens = tokens_used, "task completed");
            }
            EngineEvent::TaskFailed {
                task_id,
                kind,
                message,
            } => {
                tracing::warn!(task_id = %task_id, kind = %kind, "task failed: {}", message);
            }
            EngineEvent::TaskBlocked {
                task_id,
                blocked_on,
            } => {
                tracing::warn!(task_id = %task_id, blocked_on = %blocked_on, "task blocked");
            }
            EngineEvent::BudgetWarning { used, limit } => {
                tracing::warn!(used, limit, "budget warning threshold crossed");
            }
            EngineEvent::BudgetExhausted { used, limit } => {
                tracing::error!(used, limit, "budget exhausted, refusing new dispatches");
            }
            EngineEvent::ReviewEmitted { depth, new_tasks } => {
                tracing::info!(depth, new_tasks, "review pass emitted follow-up tasks");
            }
            EngineEvent::Shutdown { reason } => {
                tracing::info!(reason = %reason, "engine shutdown");
            }
        }
    }
}

impl ProgressSink for TracingSink {
    fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        tracing::debug!(task_id = %task_id, ?from, ?to, "task transition");
    }
}

/// 收集型 sink：测试注入用，记录所有事件与迁移
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
    transitions: Mutex<Vec<(String, TaskStatus, TaskStatus)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn transitions(&self) -> Vec<(String, TaskStatus, TaskStatus)> {
        self.transitions.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn event(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl ProgressSink for CollectingSink {
    fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        self.transitions
            .lock()
            .unwrap()
            .push((task_id.to_string(), from, to));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_records_events() {
        let sink = CollectingSink::new();
        sink.event(&EngineEvent::BudgetWarning {
            used: 80,
            limit: 100,
        });
        sink.transition("t1", TaskStatus::Pending, TaskStatus::Ready);

        assert_eq!(sink.events().len(), 1);
        let transitions = sink.transitions();
        assert_eq!(
            transitions[0],
            ("t1".to_string(), TaskStatus::Pending, TaskStatus::Ready)
        );
    }
}
