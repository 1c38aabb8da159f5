//! 优雅关闭
//!
//! 统一的关闭信号监听：引擎级 CancellationToken 是所有执行器 token 的父节点，
//! 取消根 token 会传递到每个在途调用。关闭需在宽限时间内完成，超时的执行器
//! 被强制放弃。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起的中断 (Ctrl+C)
    Interrupt,
    /// SIGTERM 信号
    Terminate,
    /// 致命错误
    Fatal(String),
}

impl ShutdownReason {
    pub fn label(&self) -> String {
        match self {
            ShutdownReason::Interrupt => "interrupt".to_string(),
            ShutdownReason::Terminate => "terminate".to_string(),
            ShutdownReason::Fatal(msg) => format!("fatal: {msg}"),
        }
    }
}

/// 关闭信号管理器
#[derive(Debug, Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 引擎级根 token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 创建子 token（用于单个执行器 / 单次调用）
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_new() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
    }

    #[test]
    fn test_shutdown_propagates_to_children() {
        let manager = ShutdownManager::new();
        let child = manager.child_token();
        assert!(!child.is_cancelled());
        manager.shutdown(ShutdownReason::Interrupt);
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscribe_receives_reason() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::Fatal("store corrupted".to_string()));
        let reason = rx.recv().await.unwrap();
        assert!(matches!(reason, ShutdownReason::Fatal(_)));
    }
}
