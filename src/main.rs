//! Hive - 并行任务编排引擎入口
//!
//! 初始化日志、加载并校验配置、装配引擎、运行到终态，退出码：
//! 0 全部完成 / 2 有任务失败 / 3 预算耗尽 / 4 配置非法 / 130 被中断。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use hive::config::load_config;
use hive::core::error::ErrorKind;
use hive::core::{Engine, ShutdownManager};

const EXIT_CONFIG_INVALID: i32 = 4;

#[tokio::main]
async fn main() {
    hive::observability::init();

    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    // 可选首参数：额外配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("failed to load configuration")?;
    config.validate().context("configuration invalid")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let engine = Engine::builder(config)
        .with_shutdown(shutdown)
        .build()
        .await
        .context("failed to build engine")?;

    match engine.run().await {
        Ok(report) => Ok(report.outcome.exit_code()),
        Err(e) => {
            tracing::error!("engine aborted: {e}");
            Ok(match e.kind() {
                ErrorKind::Configuration => EXIT_CONFIG_INVALID,
                ErrorKind::Cancelled => 130,
                _ => 2,
            })
        }
    }
}
