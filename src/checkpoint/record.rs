//! 快照记录
//!
//! 状态机限定：CREATED→ACTIVE→COMPLETED/FAILED，FAILED→RESTORED→ACTIVE，
//! 其它一律拒绝。每条记录带 SHA-256 校验和，加载时不匹配即 CorruptCheckpoint，
//! 绝不静默纠正。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 快照状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointState {
    Created,
    Active,
    Completed,
    Failed,
    Restored,
}

impl CheckpointState {
    pub fn can_transition(self, to: CheckpointState) -> bool {
        use CheckpointState::*;
        matches!(
            (self, to),
            (Created, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Failed, Restored)
                | (Restored, Active)
        )
    }

    /// 终结态（可被按龄回收）
    pub fn is_settled(self) -> bool {
        matches!(self, CheckpointState::Completed | CheckpointState::Failed)
    }
}

/// 一条快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub task_id: String,
    /// 1 起
    pub step_number: u32,
    pub total_steps: Option<u32>,
    pub step_description: String,
    pub state: CheckpointState,
    /// 执行器捕获的任意载荷
    pub data: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub parent_checkpoint_id: Option<String>,
}

impl CheckpointRecord {
    pub fn new(
        task_id: impl Into<String>,
        step_number: u32,
        step_description: impl Into<String>,
        data: serde_json::Value,
        parent_checkpoint_id: Option<String>,
    ) -> Self {
        let task_id = task_id.into();
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            checkpoint_id: format!("cp_{}_{}_{}", task_id, step_number, now),
            task_id,
            step_number,
            total_steps: None,
            step_description: step_description.into(),
            state: CheckpointState::Created,
            data,
            created_at: now,
            updated_at: now,
            parent_checkpoint_id,
        }
    }

    /// 内容校验和（字段序固定，序列化即规范形）
    pub fn checksum(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("checkpoint record serializes");
        let digest = Sha256::digest(&bytes);
        format!("{digest:x}")
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
