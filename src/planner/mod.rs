//! 规划器
//!
//! 单循环串行处理：计算就绪前沿 → 确定性排序 → 入队派发（队列满即回压）→
//! 消费执行器的完成信号决定后续（退避重试 / 阻塞下游 / 推进）。前沿排空后
//! 跑复查轮，复查产出的新任务并入存储再来一遍，直到没有新任务或达到深度上限。

pub mod graph;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::budget::BudgetGovernor;
use crate::config::ReviewSection;
use crate::core::error::{EngineError, ErrorKind};
use crate::core::events::{EngineEvent, EventSink};
use crate::planner::graph::DependencyGraph;
use crate::pool::RetryPolicy;
use crate::runner::{parse_output, RunnerRequest, TaskRunner};
use crate::store::task::{Task, TaskFailure, TaskId, TaskStatus};
use crate::store::TaskStore;

/// 执行器 → 规划器的信号（重试定时器也走这条通道）
#[derive(Debug)]
pub enum PlannerSignal {
    Completed {
        task_id: TaskId,
        executor_id: usize,
    },
    Failed {
        task_id: TaskId,
        executor_id: usize,
        kind: ErrorKind,
        message: String,
    },
    /// 执行器未调用工具就把任务放回了 READY
    Released {
        task_id: TaskId,
        executor_id: usize,
        reason: ReleaseReason,
    },
    /// 退避到期，FAILED → READY
    Requeue { task_id: TaskId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    BudgetDenied,
    BreakerOpen,
    Shutdown,
}

/// 规划结论（引擎据此定退出码）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerOutcome {
    /// 全部任务完成
    Completed,
    /// 存在 FAILED / BLOCKED 任务
    TasksFailed,
    /// strict 预算拒绝后排空
    BudgetExhausted,
    /// 取消
    Cancelled,
}

pub struct Planner {
    store: Arc<TaskStore>,
    budget: Arc<BudgetGovernor>,
    runner: Arc<dyn TaskRunner>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    review: ReviewSection,
    workspace: PathBuf,
    worker_timeout: Duration,
    cancel: CancellationToken,
    dispatch_tx: mpsc::Sender<TaskId>,
    signal_tx: mpsc::UnboundedSender<PlannerSignal>,
    signal_rx: mpsc::UnboundedReceiver<PlannerSignal>,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        budget: Arc<BudgetGovernor>,
        runner: Arc<dyn TaskRunner>,
        events: Arc<dyn EventSink>,
        retry: RetryPolicy,
        review: ReviewSection,
        workspace: PathBuf,
        worker_timeout: Duration,
        cancel: CancellationToken,
        dispatch_tx: mpsc::Sender<TaskId>,
        signal_tx: mpsc::UnboundedSender<PlannerSignal>,
        signal_rx: mpsc::UnboundedReceiver<PlannerSignal>,
    ) -> Self {
        Self {
            store,
            budget,
            runner,
            events,
            retry,
            review,
            workspace,
            worker_timeout,
            cancel,
            dispatch_tx,
            signal_tx,
            signal_rx,
        }
    }

    /// 主循环；返回时引擎进入关闭序
    pub async fn run(mut self) -> Result<PlannerOutcome, EngineError> {
        self.fail_cycles().await?;

        let mut in_flight: HashSet<TaskId> = HashSet::new();
        let mut pending_retries: usize = 0;
        let mut budget_exhausted = false;
        let mut review_depth: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(PlannerOutcome::Cancelled);
            }

            self.reconcile().await?;
            if !budget_exhausted && !self.dispatch_ready(&mut in_flight).await? {
                budget_exhausted = true;
                self.events.event(&EngineEvent::BudgetExhausted {
                    used: self.budget.tokens_used(),
                    limit: self.budget.total_limit(),
                });
            }

            // 排空判定：没有在途任务、没有等着重试的任务
            if in_flight.is_empty() && pending_retries == 0 {
                let counts = self.store.counts().await;
                if budget_exhausted {
                    return Ok(PlannerOutcome::BudgetExhausted);
                }
                if counts.ready == 0 && counts.running == 0 {
                    if counts.pending > 0 {
                        // 依赖已无法满足的兜底（正常情况 reconcile 已处理）
                        self.block_stuck_pending().await?;
                        continue;
                    }
                    // 前沿已排空：复查轮
                    if self.review.enabled && review_depth < self.review.max_depth {
                        review_depth += 1;
                        match self.review_pass(review_depth).await {
                            Ok(added) if added > 0 => {
                                self.fail_cycles().await?;
                                continue;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(depth = review_depth, "review pass rejected: {e}")
                            }
                        }
                    }
                    let counts = self.store.counts().await;
                    return Ok(if counts.failed > 0 || counts.blocked > 0 {
                        PlannerOutcome::TasksFailed
                    } else {
                        PlannerOutcome::Completed
                    });
                }
            }

            let signal = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(PlannerOutcome::Cancelled),
                signal = self.signal_rx.recv() => signal,
            };
            let Some(signal) = signal else {
                return Ok(PlannerOutcome::Cancelled);
            };
            self.handle_signal(
                signal,
                &mut in_flight,
                &mut pending_retries,
                &mut budget_exhausted,
            )
            .await?;
        }
    }

    async fn handle_signal(
        &mut self,
        signal: PlannerSignal,
        in_flight: &mut HashSet<TaskId>,
        pending_retries: &mut usize,
        budget_exhausted: &mut bool,
    ) -> Result<(), EngineError> {
        match signal {
            PlannerSignal::Completed { task_id, .. } => {
                in_flight.remove(&task_id);
            }
            PlannerSignal::Failed {
                task_id,
                executor_id,
                kind,
                message,
            } => {
                in_flight.remove(&task_id);
                let task = self.store.get(&task_id).await?;
                let allowed = kind.attempts_allowed(self.retry.max_retries);
                if kind.is_retryable() && task.attempts < allowed && !self.cancel.is_cancelled() {
                    let delay = self.retry.backoff(task.attempts);
                    tracing::info!(
                        task_id = %task_id,
                        executor_id,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling retry"
                    );
                    *pending_retries += 1;
                    let tx = self.signal_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(PlannerSignal::Requeue { task_id });
                    });
                } else {
                    tracing::warn!(
                        task_id = %task_id,
                        kind = %kind,
                        attempts = task.attempts,
                        "task failed terminally: {message}"
                    );
                    self.block_dependents(&task_id).await?;
                }
            }
            PlannerSignal::Released {
                task_id, reason, ..
            } => {
                in_flight.remove(&task_id);
                if reason == ReleaseReason::BudgetDenied && !*budget_exhausted {
                    *budget_exhausted = true;
                    self.events.event(&EngineEvent::BudgetExhausted {
                        used: self.budget.tokens_used(),
                        limit: self.budget.total_limit(),
                    });
                }
            }
            PlannerSignal::Requeue { task_id } => {
                *pending_retries = pending_retries.saturating_sub(1);
                match self
                    .store
                    .transition(&task_id, TaskStatus::Failed, TaskStatus::Ready, |_| {})
                    .await
                {
                    Ok(_) => {}
                    // 外部改了状态（比如删除重建），放弃这次重试
                    Err(EngineError::Conflict(_)) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// 提升就绪 + 阻塞传播，循环到不动点
    async fn reconcile(&self) -> Result<(), EngineError> {
        loop {
            let all = self.store.list().await;
            let by_id: HashMap<&str, &Task> =
                all.iter().map(|t| (t.id.as_str(), t)).collect();
            let mut changed = false;

            for task in all.iter().filter(|t| t.status == TaskStatus::Pending) {
                let mut blocked_on: Option<TaskId> = None;
                let mut all_completed = true;
                for dep in &task.dependencies {
                    match by_id.get(dep.as_str()) {
                        Some(d) if d.status == TaskStatus::Completed => {}
                        Some(d)
                            if d.status == TaskStatus::Blocked
                                || self.is_failed_final(d) =>
                        {
                            blocked_on = Some(dep.clone());
                            break;
                        }
                        _ => all_completed = false,
                    }
                }

                if let Some(dep) = blocked_on {
                    self.store
                        .transition(&task.id, TaskStatus::Pending, TaskStatus::Blocked, |_| {})
                        .await?;
                    self.events.event(&EngineEvent::TaskBlocked {
                        task_id: task.id.clone(),
                        blocked_on: dep,
                    });
                    changed = true;
                } else if all_completed {
                    self.store
                        .transition(&task.id, TaskStatus::Pending, TaskStatus::Ready, |_| {})
                        .await?;
                    changed = true;
                }
            }

            if !changed {
                return Ok(());
            }
        }
    }

    /// 按全局确定性序派发 READY 任务；返回 false 表示 strict 预算拒绝
    async fn dispatch_ready(
        &mut self,
        in_flight: &mut HashSet<TaskId>,
    ) -> Result<bool, EngineError> {
        let all = self.store.list().await;
        let status: HashMap<&str, TaskStatus> =
            all.iter().map(|t| (t.id.as_str(), t.status)).collect();
        let graph = DependencyGraph::build(&all);
        let (order, _) = graph.topo_order();

        for id in order {
            if status.get(id.as_str()) != Some(&TaskStatus::Ready) || in_flight.contains(&id) {
                continue;
            }
            match self.budget.admit(self.budget.estimated_cost()) {
                Ok(()) => {}
                Err(EngineError::BudgetExhausted { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(true),
                sent = self.dispatch_tx.send(id.clone()) => {
                    if sent.is_err() {
                        // 池已关闭
                        return Ok(true);
                    }
                }
            }
            in_flight.insert(id);
        }
        Ok(true)
    }

    /// 环上任务全部判失败（派发前），下游交给 reconcile 阻塞
    async fn fail_cycles(&self) -> Result<(), EngineError> {
        let all = self.store.list().await;
        let graph = DependencyGraph::build(&all);
        let (_, cyclic) = graph.topo_order();
        if cyclic.is_empty() {
            return Ok(());
        }
        tracing::error!(members = ?cyclic, "dependency cycle detected");
        let message = format!("dependency cycle: {}", cyclic.join(" -> "));
        for id in &cyclic {
            let current = self.store.get(id).await?;
            if current.status != TaskStatus::Pending {
                continue;
            }
            let failure = TaskFailure {
                kind: ErrorKind::DependencyCycle,
                message: message.clone(),
            };
            self.store
                .transition(id, TaskStatus::Pending, TaskStatus::Failed, |t| {
                    t.last_error = Some(failure);
                })
                .await?;
            self.events.event(&EngineEvent::TaskFailed {
                task_id: id.clone(),
                kind: ErrorKind::DependencyCycle,
                message: message.clone(),
            });
        }
        Ok(())
    }

    /// `failed_id` 的全部传递下游转 BLOCKED
    async fn block_dependents(&self, failed_id: &str) -> Result<(), EngineError> {
        let all = self.store.list().await;
        let graph = DependencyGraph::build(&all);
        for dependent in graph.transitive_dependents(failed_id) {
            let task = self.store.get(&dependent).await?;
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                self.store
                    .transition(&dependent, task.status, TaskStatus::Blocked, |_| {})
                    .await?;
                self.events.event(&EngineEvent::TaskBlocked {
                    task_id: dependent.clone(),
                    blocked_on: failed_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// 兜底：依赖永远无法满足的 PENDING 任务全部阻塞
    async fn block_stuck_pending(&self) -> Result<(), EngineError> {
        for task in self.store.list_by_status(TaskStatus::Pending).await {
            tracing::warn!(task_id = %task.id, "pending task has unsatisfiable dependencies");
            self.store
                .transition(&task.id, TaskStatus::Pending, TaskStatus::Blocked, |_| {})
                .await?;
            self.events.event(&EngineEvent::TaskBlocked {
                task_id: task.id.clone(),
                blocked_on: task.dependencies.first().cloned().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn is_failed_final(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Failed {
            return false;
        }
        match &task.last_error {
            Some(failure) => {
                !failure.kind.is_retryable()
                    || task.attempts >= failure.kind.attempts_allowed(self.retry.max_retries)
            }
            None => true,
        }
    }

    /// 复查轮：汇总提示词调一次外部工具，按合约收新任务
    async fn review_pass(&self, depth: u32) -> Result<usize, EngineError> {
        if self.budget.admit(self.budget.estimated_cost()).is_err() {
            tracing::warn!("skipping review pass, budget exhausted");
            return Ok(0);
        }

        let all = self.store.list().await;
        let prompt = self.review_prompt(&all);
        let review_id = format!("review-{depth}");
        let request = RunnerRequest {
            task_id: review_id.clone(),
            executor_id: 0,
            prompt,
            working_dir: self.workspace.clone(),
            timeout: self.worker_timeout,
        };

        let raw = self.runner.invoke(&request, &self.cancel).await?;
        let output = parse_output(&raw)?;
        self.budget.record(&review_id, output.tokens_used);

        if output.follow_up_tasks.is_empty() {
            tracing::info!(depth, "review pass emitted no follow-up tasks");
            return Ok(0);
        }

        // 合约校验：id 不冲突、依赖可解析；任何一条不合法整批拒绝
        let existing: HashSet<&str> = all.iter().map(|t| t.id.as_str()).collect();
        let mut batch_ids: HashSet<String> = HashSet::new();
        for spec in &output.follow_up_tasks {
            if spec.title.trim().is_empty() || spec.description.trim().is_empty() {
                return Err(EngineError::Protocol(
                    "follow-up task with empty title or description".to_string(),
                ));
            }
            if let Some(id) = &spec.id {
                if existing.contains(id.as_str()) || !batch_ids.insert(id.clone()) {
                    return Err(EngineError::Protocol(format!(
                        "follow-up task id '{id}' collides"
                    )));
                }
            }
            for dep in &spec.dependencies {
                if !existing.contains(dep.as_str()) && !batch_ids.contains(dep) {
                    return Err(EngineError::Protocol(format!(
                        "follow-up task depends on unknown task '{dep}'"
                    )));
                }
            }
        }

        let count = output.follow_up_tasks.len();
        for spec in output.follow_up_tasks {
            let id = spec
                .id
                .unwrap_or_else(|| format!("followup-{}", uuid::Uuid::new_v4()));
            let mut task = Task::new(id, spec.title, spec.description)
                .with_dependencies(spec.dependencies);
            if let Some(priority) = spec.priority {
                task.priority = priority;
            }
            self.store.insert(task).await?;
        }

        self.events.event(&EngineEvent::ReviewEmitted {
            depth,
            new_tasks: count,
        });
        Ok(count)
    }

    fn review_prompt(&self, all: &[Task]) -> String {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for task in all {
            match task.status {
                TaskStatus::Completed => {
                    let summary = task
                        .result
                        .as_ref()
                        .map(|r| r.summary.as_str())
                        .unwrap_or("");
                    let mut line = format!("- {} ({}): {}", task.id, task.title, summary);
                    if line.len() > 300 {
                        line.truncate(300);
                        line.push_str("...");
                    }
                    completed.push(line);
                }
                TaskStatus::Failed | TaskStatus::Blocked => {
                    let reason = task
                        .last_error
                        .as_ref()
                        .map(|e| e.message.as_str())
                        .unwrap_or("blocked by a failed dependency");
                    failed.push(format!("- {} ({}): {}", task.id, task.title, reason));
                }
                _ => {}
            }
        }

        let mut parts = vec![
            "You are reviewing a finished batch of engineering tasks.".to_string(),
            format!("Completed tasks:\n{}", completed.join("\n")),
        ];
        if !failed.is_empty() {
            parts.push(format!("Failed or blocked tasks:\n{}", failed.join("\n")));
        }
        parts.push(
            "Decide whether any follow-up work is required (missing pieces, \
             integration gaps, obvious defects). Only emit follow-ups that are \
             genuinely necessary."
                .to_string(),
        );
        parts.push(
            "IMPORTANT: the first line of your reply must be a single JSON object: \
             {\"tokens_used\": <int>, \"created_files\": [], \"modified_files\": [], \
             \"follow_up_tasks\": [{\"title\": str, \"description\": str, \
             \"dependencies\": [task ids]}]}. \
             Use an empty follow_up_tasks array if nothing is needed."
                .to_string(),
        );
        parts.join("\n\n")
    }
}
