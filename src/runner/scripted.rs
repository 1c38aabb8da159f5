//! 脚本化运行器（测试替身，无需外部工具）
//!
//! 按任务 id 预置输出序列：每次调用弹出下一条脚本；序列耗尽或未登记时
//! 返回默认成功输出。可按执行器编号模拟前 N 次瞬态失败，用于熔断测试。
//! 所有调用按到达顺序记录，供测试断言派发次序。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::{EngineError, ErrorKind};
use crate::runner::output::format_output;
use crate::runner::{RunnerRequest, TaskRunner};

/// 一条脚本：成功返回原始文本，或按种类失败
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Ok(String),
    Fail(ErrorKind, String),
}

impl ScriptStep {
    /// 合约成功输出的便捷构造
    pub fn ok_with_tokens(tokens: u64, text: &str) -> Self {
        ScriptStep::Ok(format_output(tokens, &[], &[], text))
    }
}

/// 记录的一次调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub task_id: String,
    pub executor_id: usize,
}

/// 每执行器故障注入
#[derive(Debug, Clone, Copy)]
struct ExecutorFault {
    remaining: u32,
}

#[derive(Default)]
struct ScriptedState {
    scripts: HashMap<String, VecDeque<ScriptStep>>,
    faults: HashMap<usize, ExecutorFault>,
    invocations: Vec<Invocation>,
}

/// 脚本化运行器
pub struct ScriptedRunner {
    state: Mutex<ScriptedState>,
    default_tokens: u64,
    /// 每次调用前的人工延迟（模拟慢速工具）
    latency: Option<Duration>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptedState::default()),
            default_tokens: 10,
            latency: None,
        }
    }

    pub fn with_default_tokens(mut self, tokens: u64) -> Self {
        self.default_tokens = tokens;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 为任务追加一条脚本
    pub fn script(&self, task_id: &str, step: ScriptStep) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(task_id.to_string())
            .or_default()
            .push_back(step);
    }

    /// 为任务追加 N 条同样的失败脚本
    pub fn script_failures(&self, task_id: &str, kind: ErrorKind, message: &str, count: u32) {
        for _ in 0..count {
            self.script(task_id, ScriptStep::Fail(kind, message.to_string()));
        }
    }

    /// 指定执行器的前 `count` 次调用注入瞬态失败（熔断测试）
    pub fn fail_executor_first(&self, executor_id: usize, count: u32) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(executor_id, ExecutorFault { remaining: count });
    }

    /// 到达顺序的全部调用记录
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn invocation_count(&self, task_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|inv| inv.task_id == task_id)
            .count()
    }

    fn next_step(&self, request: &RunnerRequest) -> ScriptStep {
        let mut state = self.state.lock().unwrap();
        state.invocations.push(Invocation {
            task_id: request.task_id.clone(),
            executor_id: request.executor_id,
        });

        if let Some(fault) = state.faults.get_mut(&request.executor_id) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return ScriptStep::Fail(
                    ErrorKind::Transient,
                    format!("injected fault on executor {}", request.executor_id),
                );
            }
        }

        if let Some(queue) = state.scripts.get_mut(&request.task_id) {
            if let Some(step) = queue.pop_front() {
                return step;
            }
        }
        ScriptStep::Ok(format_output(
            self.default_tokens,
            &[],
            &[],
            &format!("completed {}", request.task_id),
        ))
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn invoke(
        &self,
        request: &RunnerRequest,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        match self.next_step(request) {
            ScriptStep::Ok(raw) => Ok(raw),
            ScriptStep::Fail(kind, message) => Err(match kind {
                ErrorKind::Protocol => EngineError::Protocol(message),
                ErrorKind::Validation => EngineError::Validation(message),
                ErrorKind::Cancelled => EngineError::Cancelled,
                _ => EngineError::Transient(message),
            }),
        }
    }
}
