//! 有界执行器池
//!
//! 固定数量的执行器共享一条有界派发队列；队列满时规划器的提交会等待，
//! 这就是回压。每个执行器自带熔断器，单个执行器异常不影响其余执行器排空队列。

pub mod breaker;
pub mod retry;
pub mod worker;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::store::task::TaskId;
pub use breaker::{Availability, BreakerConfig, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;
pub use worker::{Executor, ExecutorEnv};

/// 执行器池句柄：持有全部执行器的 JoinHandle
pub struct ExecutorPool {
    joins: Vec<JoinHandle<()>>,
}

impl ExecutorPool {
    /// 启动 `env.max_workers` 个执行器，共享同一个接收端
    pub fn spawn(env: ExecutorEnv, queue_rx: mpsc::Receiver<TaskId>) -> Self {
        let shared_rx = Arc::new(Mutex::new(queue_rx));
        let mut joins = Vec::with_capacity(env.max_workers);
        for executor_id in 0..env.max_workers {
            let executor = Executor::new(executor_id, &env);
            let rx = Arc::clone(&shared_rx);
            joins.push(tokio::spawn(async move {
                executor.run(rx).await;
            }));
        }
        Self { joins }
    }

    /// 等待全部执行器退出
    pub async fn join(self) {
        for join in self.joins {
            let _ = join.await;
        }
    }

    /// 宽限时间内等待退出，超时则放弃剩余执行器
    pub async fn join_with_grace(self, grace: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for join in self.joins {
            if tokio::time::timeout_at(deadline, join).await.is_err() {
                tracing::warn!("executor did not stop within shutdown grace, abandoning");
            }
        }
    }
}
