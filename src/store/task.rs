//! 任务数据模型
//!
//! 任务由外部创建（或由复查轮追加），引擎只通过存储的事务 API 修改，从不删除。
//! 状态迁移限定在白名单内；同态迁移视为无操作。

use serde::{Deserialize, Serialize};

use crate::core::error::ErrorKind;

/// 任务 ID（跨运行稳定的不透明字符串）
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待依赖完成
    #[default]
    Pending,
    /// 依赖齐备，可派发
    Ready,
    /// 正被唯一一个执行器持有
    Running,
    /// 成功结果已入库
    Completed,
    /// 执行失败（重试期间短暂停留，或终态）
    Failed,
    /// 依赖链上游失败，永不派发
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }
}

/// 任务优先级：High 排最前
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// 成功结果载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// 工具输出的说明文本
    pub summary: String,
    pub created_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub tokens_used: u64,
}

/// 结构化失败记录（最后一次错误）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// 任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// 实际发起的调用次数，受 max_retries + 1 约束
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<TaskFailure>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// 注入下一次提示词的上下文（上次失败摘要，或恢复标记）
    #[serde(default)]
    pub retry_context: Option<String>,
    /// 毫秒时间戳
    pub created_at: i64,
    pub updated_at: i64,
    /// 乐观并发版本号，每次修改 +1
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            attempts: 0,
            last_error: None,
            result: None,
            retry_context: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_created_at(mut self, millis: i64) -> Self {
        self.created_at = millis;
        self.updated_at = millis;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 状态迁移白名单；同态迁移返回 true（调用方视作无操作）
pub fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Ready)
            | (Ready, Running)
            | (Running, Completed)
            | (Running, Failed)
            // 释放（预算拒绝 / 熔断 / 取消）与快照恢复
            | (Running, Ready)
            // 重试
            | (Failed, Ready)
            // 成环的任务在派发前直接失败
            | (Pending, Failed)
            // 依赖失败向下游传播
            | (Pending, Blocked)
            | (Ready, Blocked)
            | (Failed, Blocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::new("t1", "Build parser", "Implement the config parser")
            .with_priority(TaskPriority::High)
            .with_dependencies(vec!["t0".to_string()]);

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn test_unknown_status_rejected() {
        let json = r#"{
            "id": "t1", "title": "x", "description": "y",
            "status": "paused", "created_at": 0, "updated_at": 0
        }"#;
        assert!(serde_json::from_str::<Task>(json).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::Low);
    }

    #[test]
    fn test_transition_whitelist() {
        use TaskStatus::*;
        assert!(transition_allowed(Pending, Ready));
        assert!(transition_allowed(Ready, Running));
        assert!(transition_allowed(Running, Completed));
        assert!(transition_allowed(Running, Failed));
        assert!(transition_allowed(Running, Ready));
        assert!(transition_allowed(Failed, Ready));
        assert!(transition_allowed(Pending, Failed));
        assert!(transition_allowed(Pending, Blocked));

        assert!(!transition_allowed(Completed, Running));
        assert!(!transition_allowed(Completed, Ready));
        assert!(!transition_allowed(Blocked, Ready));
        assert!(!transition_allowed(Failed, Running));
        assert!(!transition_allowed(Pending, Running));

        // 同态迁移是无操作
        assert!(transition_allowed(Running, Running));
        assert!(transition_allowed(Completed, Completed));
    }
}
