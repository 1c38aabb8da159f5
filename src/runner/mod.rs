//! 外部 LLM CLI 端口
//!
//! 引擎对工具只有一个抽象：给定提示词与工作目录，拿回原始 stdout 文本。
//! 真实实现按配置拉起子进程；测试注入脚本化替身按任务 id 返回预置输出。

pub mod claude;
pub mod output;
pub mod scripted;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::EngineError;

pub use claude::CliRunner;
pub use output::{parse_output, FollowUpSpec, RunnerOutput};
pub use scripted::{Invocation, ScriptStep, ScriptedRunner};

/// 一次外部调用的请求
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    pub task_id: String,
    /// 发起调用的执行器编号（复查轮为 0）
    pub executor_id: usize,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// 外部工具端口：返回原始 stdout，解析交给 [`output::parse_output`]
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn invoke(
        &self,
        request: &RunnerRequest,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;
}
