//! 真实 CLI 子进程实现
//!
//! 每次调用拉起一个子进程：提示词从 stdin 写入，stdout 作为 UTF-8 结果，
//! 退出码给出粗粒度成败。超时 / 取消 / 引擎关闭都会终止子进程
//! （先 SIGTERM，宽限 5 秒后 SIGKILL），不留孤儿。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerSection;
use crate::core::error::EngineError;
use crate::runner::{RunnerRequest, TaskRunner};

/// SIGTERM 之后等待子进程自行退出的宽限
const KILL_GRACE: Duration = Duration::from_secs(5);
/// 凭证最短长度，短于此按未配置处理
const MIN_CREDENTIAL_LEN: usize = 8;

/// 外部 LLM CLI 子进程运行器
#[derive(Debug)]
pub struct CliRunner {
    command: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl CliRunner {
    /// 从配置构建；凭证变量启动时校验一次，之后不再读取其它运行期变量
    pub fn from_config(cfg: &RunnerSection) -> Result<Self, EngineError> {
        let credential = std::env::var(&cfg.credential_var).unwrap_or_default();
        if credential.trim().len() < MIN_CREDENTIAL_LEN {
            return Err(EngineError::Configuration(format!(
                "{} is not set (or too short) in the environment",
                cfg.credential_var
            )));
        }
        Ok(Self {
            command: cfg.command.clone(),
            model: cfg.model.clone(),
            extra_args: cfg.extra_args.clone(),
        })
    }

    async fn terminate(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "child ignored SIGTERM, escalating to SIGKILL");
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl TaskRunner for CliRunner {
    async fn invoke(
        &self,
        request: &RunnerRequest,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let mut cmd = Command::new(&self.command);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        cmd.args(&self.extra_args);
        cmd.current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            task_id = %request.task_id,
            executor_id = request.executor_id,
            command = %self.command,
            "spawning runner subprocess"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Transient(format!("spawn '{}': {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Transient("child stdin unavailable".to_string()))?;
        stdin
            .write_all(request.prompt.as_bytes())
            .await
            .map_err(|e| EngineError::Transient(format!("write prompt: {e}")))?;
        drop(stdin); // 关闭 stdin，工具才会开始处理

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        enum WaitOutcome {
            Cancelled,
            TimedOut,
            Exited(std::io::Result<std::process::ExitStatus>),
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(request.timeout) => WaitOutcome::TimedOut,
            status = child.wait() => WaitOutcome::Exited(status),
        };
        let status = match outcome {
            WaitOutcome::Cancelled => {
                Self::terminate(&mut child).await;
                return Err(EngineError::Cancelled);
            }
            WaitOutcome::TimedOut => {
                Self::terminate(&mut child).await;
                return Err(EngineError::Transient(format!(
                    "runner timed out after {}s",
                    request.timeout.as_secs()
                )));
            }
            WaitOutcome::Exited(status) => {
                status.map_err(|e| EngineError::Transient(format!("wait: {e}")))?
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(EngineError::Transient(format!(
                "runner exited with {status}: {}",
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}
