//! 引擎装配与运行
//!
//! 负责：打开存储、恢复协议、快照回收、拉起执行器池与规划器、关闭序
//! （停止派发 → 取消执行器 → 宽限 join → 刷盘 → 终态事件 → 总结报告）。
//! 组件都走端口注入，测试用脚本化运行器 + 临时目录构独立实例。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::budget::BudgetGovernor;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::AppConfig;
use crate::core::error::{EngineError, ErrorKind};
use crate::core::events::{EngineEvent, EventSink, ProgressSink, TracingSink};
use crate::core::shutdown::ShutdownManager;
use crate::planner::{Planner, PlannerOutcome};
use crate::pool::{BreakerConfig, ExecutorEnv, ExecutorPool, RetryPolicy};
use crate::runner::{CliRunner, TaskRunner};
use crate::store::task::{TaskFailure, TaskStatus};
use crate::store::{StatusCounts, TaskStore};

/// 引擎结论 → 进程退出码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// 全部任务完成
    Completed,
    /// 存在失败 / 阻塞任务
    TasksFailed,
    /// strict 预算耗尽
    BudgetExhausted,
    /// 用户中断
    Interrupted,
}

impl EngineOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            EngineOutcome::Completed => 0,
            EngineOutcome::TasksFailed => 2,
            EngineOutcome::BudgetExhausted => 3,
            EngineOutcome::Interrupted => 130,
        }
    }
}

/// 一次运行的总结
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub outcome: EngineOutcome,
    pub counts: StatusCounts,
    pub tokens_used: u64,
    pub elapsed: Duration,
}

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    runner: Option<Arc<dyn TaskRunner>>,
    events: Option<Arc<dyn EventSink>>,
    progress: Option<Arc<dyn ProgressSink>>,
    shutdown: Option<Arc<ShutdownManager>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            runner: None,
            events: None,
            progress: None,
            shutdown: None,
        }
    }

    /// 注入运行器（测试用脚本化替身）
    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;

        let events = self.events.unwrap_or_else(|| Arc::new(TracingSink));
        let progress = self.progress.unwrap_or_else(|| Arc::new(TracingSink));

        let store = TaskStore::open(self.config.app.store_path())
            .await?
            .with_progress(progress);
        let checkpoints = CheckpointStore::open(self.config.checkpoint_root()).await?;
        let budget = Arc::new(BudgetGovernor::new(&self.config.budget, events.clone()));
        // 真实运行器在这里校验凭证；注入的替身不需要凭证
        let runner = match self.runner {
            Some(runner) => runner,
            None => Arc::new(CliRunner::from_config(&self.config.runner)?),
        };
        let shutdown = self
            .shutdown
            .unwrap_or_else(|| Arc::new(ShutdownManager::new()));

        Ok(Engine {
            config: self.config,
            store: Arc::new(store),
            checkpoints: Arc::new(checkpoints),
            budget,
            runner,
            events,
            shutdown,
        })
    }
}

/// 编排引擎
pub struct Engine {
    config: AppConfig,
    store: Arc<TaskStore>,
    checkpoints: Arc<CheckpointStore>,
    budget: Arc<BudgetGovernor>,
    runner: Arc<dyn TaskRunner>,
    events: Arc<dyn EventSink>,
    shutdown: Arc<ShutdownManager>,
}

impl Engine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// 跑到所有任务终态（或预算耗尽 / 中断），返回总结
    pub async fn run(&self) -> Result<EngineReport, EngineError> {
        let started = std::time::Instant::now();

        self.resume_interrupted().await?;
        let max_age = Duration::from_secs(self.config.checkpoint.max_age_days * 24 * 3600);
        if let Err(e) = self.checkpoints.gc(max_age).await {
            tracing::warn!("checkpoint gc failed: {e}");
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.config.pool.queue_depth());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let pool_cancel = self.shutdown.child_token();
        let env = ExecutorEnv {
            max_workers: self.config.pool.max_workers,
            store: Arc::clone(&self.store),
            runner: Arc::clone(&self.runner),
            budget: Arc::clone(&self.budget),
            checkpoints: Arc::clone(&self.checkpoints),
            events: Arc::clone(&self.events),
            signal_tx: signal_tx.clone(),
            cancel: pool_cancel.clone(),
            breaker_config: BreakerConfig {
                failure_threshold: self.config.breaker.failure_threshold,
                open_cooldown: Duration::from_secs(self.config.breaker.open_cooldown_secs),
                max_cooldown: Duration::from_secs(self.config.breaker.max_cooldown_secs),
            },
            worker_timeout: Duration::from_secs(self.config.pool.worker_timeout_secs),
            workspace: self.config.app.workspace(),
        };
        tokio::fs::create_dir_all(&env.workspace).await?;
        let pool = ExecutorPool::spawn(env, dispatch_rx);

        let planner = Planner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.budget),
            Arc::clone(&self.runner),
            Arc::clone(&self.events),
            RetryPolicy::new(
                self.config.retry.max_retries,
                Duration::from_secs_f64(self.config.retry.base_delay_secs),
                Duration::from_secs_f64(self.config.retry.max_delay_secs),
            ),
            self.config.review.clone(),
            self.config.app.workspace(),
            Duration::from_secs(self.config.pool.worker_timeout_secs),
            self.shutdown.token(),
            dispatch_tx,
            signal_tx,
            signal_rx,
        );
        let planner_result = planner.run().await;

        // 关闭序：取消执行器，宽限 join，刷盘
        pool_cancel.cancel();
        pool.join_with_grace(Duration::from_secs(self.config.app.shutdown_grace_secs))
            .await;
        self.store.flush().await?;
        let budget_path = self.config.app.store_path().with_file_name("budget.json");
        if let Err(e) = self.budget.persist(&budget_path).await {
            tracing::warn!("budget snapshot not persisted: {e}");
        }

        let outcome = match planner_result? {
            PlannerOutcome::Completed => EngineOutcome::Completed,
            PlannerOutcome::TasksFailed => EngineOutcome::TasksFailed,
            PlannerOutcome::BudgetExhausted => EngineOutcome::BudgetExhausted,
            PlannerOutcome::Cancelled => EngineOutcome::Interrupted,
        };
        self.events.event(&EngineEvent::Shutdown {
            reason: format!("{outcome:?}"),
        });

        let report = EngineReport {
            outcome,
            counts: self.store.counts().await,
            tokens_used: self.budget.tokens_used(),
            elapsed: started.elapsed(),
        };
        self.log_final_report(&report).await;
        Ok(report)
    }

    /// 恢复协议：上一轮遗留的 RUNNING 任务，按最近未完成快照的年龄决定
    /// 恢复（→READY + RESTORED 标记）还是判失败（→FAILED, StaleCheckpoint）。
    /// 重启后绝不留任务在 RUNNING。
    async fn resume_interrupted(&self) -> Result<(), EngineError> {
        let stale_after = Duration::from_secs(self.config.checkpoint.stale_threshold_hours * 3600);
        let now = chrono::Utc::now().timestamp_millis();

        for task in self.store.list_by_status(TaskStatus::Running).await {
            let open = match self.checkpoints.latest_open(&task.id).await {
                Ok(open) => open,
                Err(e @ EngineError::CorruptCheckpoint(_)) => {
                    let message = e.summary();
                    tracing::error!(task_id = %task.id, "checkpoint unreadable: {message}");
                    self.store
                        .transition(&task.id, TaskStatus::Running, TaskStatus::Failed, |t| {
                            t.last_error = Some(TaskFailure {
                                kind: ErrorKind::CorruptCheckpoint,
                                message,
                            });
                        })
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match open {
                Some(cp) if now - cp.updated_at < stale_after.as_millis() as i64 => {
                    // 留痕：快照走 FAILED→RESTORED
                    if cp.state == CheckpointState::Active {
                        let _ = self
                            .checkpoints
                            .fail(&cp.checkpoint_id, "engine restarted mid-task")
                            .await;
                    }
                    let _ = self.checkpoints.restore(&cp.checkpoint_id).await;

                    let marker = format!(
                        "restored: resuming from checkpoint {} (step {}, {})",
                        cp.checkpoint_id, cp.step_number, cp.step_description
                    );
                    self.store
                        .transition(&task.id, TaskStatus::Running, TaskStatus::Ready, |t| {
                            t.retry_context = Some(marker);
                        })
                        .await?;
                    tracing::info!(task_id = %task.id, checkpoint = %cp.checkpoint_id, "task resumed");
                }
                Some(cp) => {
                    let message = format!(
                        "checkpoint {} is older than the stale threshold, previous progress untrusted",
                        cp.checkpoint_id
                    );
                    self.store
                        .transition(&task.id, TaskStatus::Running, TaskStatus::Failed, |t| {
                            t.last_error = Some(TaskFailure {
                                kind: ErrorKind::StaleCheckpoint,
                                message: message.clone(),
                            });
                        })
                        .await?;
                    self.events.event(&EngineEvent::TaskFailed {
                        task_id: task.id.clone(),
                        kind: ErrorKind::StaleCheckpoint,
                        message,
                    });
                }
                None => {
                    let message =
                        "no checkpoint found for a task the previous run left in RUNNING"
                            .to_string();
                    self.store
                        .transition(&task.id, TaskStatus::Running, TaskStatus::Failed, |t| {
                            t.last_error = Some(TaskFailure {
                                kind: ErrorKind::StaleCheckpoint,
                                message: message.clone(),
                            });
                        })
                        .await?;
                    self.events.event(&EngineEvent::TaskFailed {
                        task_id: task.id.clone(),
                        kind: ErrorKind::StaleCheckpoint,
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    /// 终端总结：逐任务一行（状态、尝试数、最后错误种类与消息），再给总量
    async fn log_final_report(&self, report: &EngineReport) {
        for task in self.store.list().await {
            match &task.last_error {
                Some(failure) if task.status != TaskStatus::Completed => {
                    tracing::info!(
                        task_id = %task.id,
                        status = ?task.status,
                        attempts = task.attempts,
                        kind = %failure.kind,
                        "  {}: {}",
                        task.title,
                        failure.message
                    );
                }
                _ => {
                    tracing::info!(
                        task_id = %task.id,
                        status = ?task.status,
                        attempts = task.attempts,
                        "  {}",
                        task.title
                    );
                }
            }
        }
        tracing::info!(
            completed = report.counts.completed,
            failed = report.counts.failed,
            blocked = report.counts.blocked,
            tokens_used = report.tokens_used,
            elapsed_secs = report.elapsed.as_secs(),
            outcome = ?report.outcome,
            "run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineOutcome::Completed.exit_code(), 0);
        assert_eq!(EngineOutcome::TasksFailed.exit_code(), 2);
        assert_eq!(EngineOutcome::BudgetExhausted.exit_code(), 3);
        assert_eq!(EngineOutcome::Interrupted.exit_code(), 130);
    }
}
