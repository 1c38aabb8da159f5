//! 执行器
//!
//! 单个执行器顺序处理任务：抢占 → 预算 → 熔断 → 组提示词 → 调用外部工具 →
//! 解析 → 产物校验 → 落库。任务边界内绝不 panic；未预期错误按瞬态归类，
//! 走正常失败管道。取消时把在途任务放回 READY 并落 RESTORED 快照。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::budget::BudgetGovernor;
use crate::checkpoint::CheckpointStore;
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventSink};
use crate::observability::EngineMetrics;
use crate::planner::{PlannerSignal, ReleaseReason};
use crate::pool::breaker::{Availability, BreakerConfig, CircuitBreaker};
use crate::runner::{parse_output, RunnerOutput, RunnerRequest, TaskRunner};
use crate::store::task::{Task, TaskFailure, TaskId, TaskResult, TaskStatus};
use crate::store::TaskStore;

/// 池级共享环境；每个执行器从这里克隆自己的一份
pub struct ExecutorEnv {
    pub max_workers: usize,
    pub store: Arc<TaskStore>,
    pub runner: Arc<dyn TaskRunner>,
    pub budget: Arc<BudgetGovernor>,
    pub checkpoints: Arc<CheckpointStore>,
    pub events: Arc<dyn EventSink>,
    pub signal_tx: mpsc::UnboundedSender<PlannerSignal>,
    pub cancel: CancellationToken,
    pub breaker_config: BreakerConfig,
    pub worker_timeout: Duration,
    pub workspace: PathBuf,
}

/// 单个执行器
pub struct Executor {
    id: usize,
    store: Arc<TaskStore>,
    runner: Arc<dyn TaskRunner>,
    budget: Arc<BudgetGovernor>,
    checkpoints: Arc<CheckpointStore>,
    events: Arc<dyn EventSink>,
    signal_tx: mpsc::UnboundedSender<PlannerSignal>,
    cancel: CancellationToken,
    breaker: CircuitBreaker,
    worker_timeout: Duration,
    workspace: PathBuf,
    /// 本执行器累计 token 用量
    tokens_used: u64,
}

impl Executor {
    pub fn new(id: usize, env: &ExecutorEnv) -> Self {
        Self {
            id,
            store: Arc::clone(&env.store),
            runner: Arc::clone(&env.runner),
            budget: Arc::clone(&env.budget),
            checkpoints: Arc::clone(&env.checkpoints),
            events: Arc::clone(&env.events),
            signal_tx: env.signal_tx.clone(),
            cancel: env.cancel.child_token(),
            breaker: CircuitBreaker::new(env.breaker_config.clone()),
            worker_timeout: env.worker_timeout,
            workspace: env.workspace.clone(),
            tokens_used: 0,
        }
    }

    /// 主循环：从共享队列取任务直到取消或队列关闭
    pub async fn run(mut self, queue: Arc<Mutex<mpsc::Receiver<TaskId>>>) {
        loop {
            let task_id = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(id) => id,
                        None => break,
                    },
                }
            };
            self.process(&task_id).await;
        }
        tracing::debug!(
            executor_id = self.id,
            tokens = self.tokens_used,
            breaker = ?self.breaker.state(),
            "executor stopped"
        );
    }

    async fn process(&mut self, task_id: &str) {
        // 1. 抢占：from 校验就是 CAS，输了就跳过
        let task = match self
            .store
            .transition(task_id, TaskStatus::Ready, TaskStatus::Running, |_| {})
            .await
        {
            Ok(task) => task,
            Err(EngineError::Conflict(_)) => {
                tracing::trace!(task_id = %task_id, executor_id = self.id, "lost reserve race");
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, executor_id = self.id, "reserve failed: {e}");
                return;
            }
        };

        // 2. 预算准入（规划器已查过一次，这里复查覆盖入队后的用量增长）
        if let Err(e) = self.budget.admit(self.budget.estimated_cost()) {
            tracing::warn!(task_id = %task_id, executor_id = self.id, "budget denied: {e}");
            self.release(task_id, ReleaseReason::BudgetDenied).await;
            return;
        }

        // 3. 熔断器
        if let Availability::OpenUntil(until) = self.breaker.check() {
            self.release(task_id, ReleaseReason::BreakerOpen).await;
            // 冷却期内不接活（可被取消打断）
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(until.into()) => {}
            }
            return;
        }

        // 4. 计一次尝试并组提示词
        let task = match self.store.update(task_id, |t| t.attempts += 1).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %task_id, "attempt bump failed: {e}");
                self.release(task_id, ReleaseReason::Shutdown).await;
                return;
            }
        };
        let prompt = self.build_prompt(&task).await;

        // 5. 快照：步号 = 尝试序号
        let parent = match self.checkpoints.latest(task_id).await {
            Ok(cp) => cp.map(|c| c.checkpoint_id),
            Err(_) => None,
        };
        let checkpoint = match self
            .checkpoints
            .create(
                task_id,
                task.attempts,
                "invoke external tool",
                serde_json::json!({ "executor_id": self.id, "attempt": task.attempts }),
                parent,
            )
            .await
        {
            Ok(cp) => {
                let _ = self.checkpoints.activate(&cp.checkpoint_id).await;
                Some(cp.checkpoint_id)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "checkpoint create failed: {e}");
                None
            }
        };

        // 6-7. 调用 + 解析 + 产物校验
        let request = RunnerRequest {
            task_id: task_id.to_string(),
            executor_id: self.id,
            prompt,
            working_dir: self.workspace.clone(),
            timeout: self.worker_timeout,
        };
        let outcome = match self.runner.invoke(&request, &self.cancel).await {
            Ok(raw) => match parse_output(&raw) {
                Ok(output) => self.validate_artifacts(output).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        // 8. 落库
        match outcome {
            Ok(output) => self.finish_success(task_id, checkpoint, output).await,
            Err(EngineError::Cancelled) => self.finish_cancelled(task_id, checkpoint).await,
            Err(e) => self.finish_failure(task_id, checkpoint, e).await,
        }
    }

    /// 提示词：任务描述 + 依赖结果 + 重试上下文 + 输出合约
    async fn build_prompt(&self, task: &Task) -> String {
        let mut parts = vec![
            format!("Task ID: {}", task.id),
            format!("Title: {}", task.title),
            format!("Description: {}", task.description),
        ];

        let mut dep_lines = Vec::new();
        for dep in &task.dependencies {
            if let Ok(dep_task) = self.store.get(dep).await {
                if let Some(result) = &dep_task.result {
                    let mut summary = result.summary.clone();
                    if summary.len() > 400 {
                        summary.truncate(400);
                        summary.push_str("...");
                    }
                    dep_lines.push(format!("- {} ({}): {}", dep, dep_task.title, summary));
                }
            }
        }
        if !dep_lines.is_empty() {
            parts.push(format!("Completed dependencies:\n{}", dep_lines.join("\n")));
        }

        if let Some(context) = &task.retry_context {
            parts.push(format!("Context from the previous attempt:\n{context}"));
        }

        parts.push(
            "Please complete this task. If it requires creating or modifying files, \
             actually write them to disk."
                .to_string(),
        );
        parts.push(
            "IMPORTANT: the first line of your reply must be a single JSON object: \
             {\"tokens_used\": <int>, \"created_files\": [paths], \"modified_files\": [paths]}. \
             Free-form explanation follows on later lines."
                .to_string(),
        );
        parts.join("\n\n")
    }

    /// 声称创建 / 修改的文件必须存在且非空
    async fn validate_artifacts(
        &self,
        output: RunnerOutput,
    ) -> Result<RunnerOutput, EngineError> {
        let mut missing = Vec::new();
        for file in output.created_files.iter().chain(&output.modified_files) {
            let path = self.workspace.join(file);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() > 0 => {}
                Ok(_) => missing.push(format!("{file} (empty)")),
                Err(_) => missing.push(file.clone()),
            }
        }
        if missing.is_empty() {
            Ok(output)
        } else {
            Err(EngineError::Validation(format!(
                "claimed files missing or empty: {}",
                missing.join(", ")
            )))
        }
    }

    async fn finish_success(
        &mut self,
        task_id: &str,
        checkpoint: Option<String>,
        output: RunnerOutput,
    ) {
        let tokens = output.tokens_used;
        self.budget.record(task_id, tokens);
        self.tokens_used += tokens;
        EngineMetrics::global().record_invocation(true, tokens);
        self.breaker.record_success();

        let result = TaskResult {
            summary: output.text,
            created_files: output.created_files,
            modified_files: output.modified_files,
            tokens_used: tokens,
        };
        let stored = self
            .store
            .transition(task_id, TaskStatus::Running, TaskStatus::Completed, |t| {
                t.result = Some(result);
                t.last_error = None;
                t.retry_context = None;
            })
            .await;
        if let Err(e) = stored {
            tracing::error!(task_id = %task_id, "completed task could not be stored: {e}");
        }
        if let Some(cp) = checkpoint {
            let _ = self
                .checkpoints
                .complete(&cp, Some(serde_json::json!({ "tokens_used": tokens })))
                .await;
        }

        self.events.event(&EngineEvent::TaskCompleted {
            task_id: task_id.to_string(),
            tokens_used: tokens,
        });
        let _ = self.signal_tx.send(PlannerSignal::Completed {
            task_id: task_id.to_string(),
            executor_id: self.id,
        });
    }

    async fn finish_failure(
        &mut self,
        task_id: &str,
        checkpoint: Option<String>,
        error: EngineError,
    ) {
        let kind = error.kind();
        let message = error.summary();
        EngineMetrics::global().record_invocation(false, 0);

        let failure = TaskFailure {
            kind,
            message: message.clone(),
        };
        let context = format!("Previous attempt failed ({kind}): {message}");
        let stored = self
            .store
            .transition(task_id, TaskStatus::Running, TaskStatus::Failed, |t| {
                t.last_error = Some(failure);
                t.retry_context = Some(context);
            })
            .await;
        if let Err(e) = stored {
            tracing::error!(task_id = %task_id, "failed task could not be stored: {e}");
        }
        if let Some(cp) = checkpoint {
            let _ = self.checkpoints.fail(&cp, &message).await;
        }

        if kind.trips_breaker() && self.breaker.record_failure() {
            tracing::warn!(
                executor_id = self.id,
                failures = self.breaker.consecutive_failures(),
                "circuit breaker opened"
            );
        }

        self.events.event(&EngineEvent::TaskFailed {
            task_id: task_id.to_string(),
            kind,
            message: message.clone(),
        });
        let _ = self.signal_tx.send(PlannerSignal::Failed {
            task_id: task_id.to_string(),
            executor_id: self.id,
            kind,
            message,
        });
    }

    /// 取消：任务回 READY，快照走 FAILED→RESTORED 留痕
    async fn finish_cancelled(&mut self, task_id: &str, checkpoint: Option<String>) {
        if let Some(cp) = checkpoint {
            let _ = self.checkpoints.fail(&cp, "interrupted by shutdown").await;
            let _ = self.checkpoints.restore(&cp).await;
        }
        let _ = self
            .store
            .transition(task_id, TaskStatus::Running, TaskStatus::Ready, |t| {
                t.retry_context = Some("restored: previous run was interrupted mid-task".to_string());
            })
            .await;
        let _ = self.signal_tx.send(PlannerSignal::Released {
            task_id: task_id.to_string(),
            executor_id: self.id,
            reason: ReleaseReason::Shutdown,
        });
    }

    /// 未调用就放手：回 READY 并通知规划器
    async fn release(&self, task_id: &str, reason: ReleaseReason) {
        let _ = self
            .store
            .transition(task_id, TaskStatus::Running, TaskStatus::Ready, |_| {})
            .await;
        let _ = self.signal_tx.send(PlannerSignal::Released {
            task_id: task_id.to_string(),
            executor_id: self.id,
            reason,
        });
    }
}
