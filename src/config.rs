//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，
//! 如 `HIVE__POOL__MAX_WORKERS=8`）。`validate()` 在引擎启动前检查取值范围，
//! 非法配置拒绝启动。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::error::EngineError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub review: ReviewSection,
}

/// [app] 段：工作目录、任务存储路径、关闭宽限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 执行器子进程的工作目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 任务存储文件，未设置时用 <workspace>/tasks.json
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            store_path: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("./workspace"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.workspace().join("tasks.json"))
    }
}

/// [pool] 段：执行器数量与单次调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 有界派发队列深度，未设置时为 2 × max_workers
    pub queue_depth: Option<usize>,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    3
}

fn default_worker_timeout_secs() -> u64 {
    1800
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_depth: None,
            worker_timeout_secs: default_worker_timeout_secs(),
        }
    }
}

impl PoolSection {
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.max_workers * 2).max(1)
    }
}

/// [retry] 段：重试次数与退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    2.0
}

fn default_max_delay_secs() -> f64 {
    60.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// [breaker] 段：每执行器熔断器参数
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_cooldown_secs")]
    pub open_cooldown_secs: u64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_cooldown_secs() -> u64 {
    60
}

fn default_max_cooldown_secs() -> u64 {
    600
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_cooldown_secs: default_open_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

/// [budget] 段：Token 预算（0 表示不限制）
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSection {
    #[serde(default)]
    pub total_limit: u64,
    #[serde(default)]
    pub per_task_limit: u64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u8,
    #[serde(default = "default_enforcement_mode")]
    pub enforcement_mode: String,
}

fn default_warning_threshold() -> u8 {
    80
}

fn default_enforcement_mode() -> String {
    "strict".to_string()
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            total_limit: 0,
            per_task_limit: 0,
            warning_threshold: default_warning_threshold(),
            enforcement_mode: default_enforcement_mode(),
        }
    }
}

/// [checkpoint] 段：快照根目录、过期清理与陈旧阈值
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    /// 未设置时用 <workspace>/.hive/checkpoints
    pub root: Option<PathBuf>,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_stale_threshold_hours")]
    pub stale_threshold_hours: u64,
}

fn default_max_age_days() -> u64 {
    30
}

fn default_stale_threshold_hours() -> u64 {
    24
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            root: None,
            max_age_days: default_max_age_days(),
            stale_threshold_hours: default_stale_threshold_hours(),
        }
    }
}

/// [runner] 段：外部 LLM CLI 程序与凭证变量
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_runner_command")]
    pub command: String,
    pub model: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_credential_var")]
    pub credential_var: String,
}

fn default_runner_command() -> String {
    "claude".to_string()
}

fn default_credential_var() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            model: None,
            extra_args: Vec::new(),
            credential_var: default_credential_var(),
        }
    }
}

/// [review] 段：前沿排空后的复查轮
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewSection {
    #[serde(default = "default_review_enabled")]
    pub enabled: bool,
    #[serde(default = "default_review_max_depth")]
    pub max_depth: u32,
}

fn default_review_enabled() -> bool {
    true
}

fn default_review_max_depth() -> u32 {
    3
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            enabled: default_review_enabled(),
            max_depth: default_review_max_depth(),
        }
    }
}

impl AppConfig {
    /// 启动前校验；任何非法取值都拒绝启动
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool.max_workers < 1 || self.pool.max_workers > 32 {
            return Err(EngineError::Configuration(format!(
                "pool.max_workers must be in 1..=32, got {}",
                self.pool.max_workers
            )));
        }
        if self.pool.worker_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "pool.worker_timeout_secs must be positive".to_string(),
            ));
        }
        if self.budget.warning_threshold > 100 {
            return Err(EngineError::Configuration(format!(
                "budget.warning_threshold must be in 0..=100, got {}",
                self.budget.warning_threshold
            )));
        }
        match self.budget.enforcement_mode.as_str() {
            "strict" | "soft" => {}
            other => {
                return Err(EngineError::Configuration(format!(
                    "budget.enforcement_mode must be 'strict' or 'soft', got '{other}'"
                )));
            }
        }
        if self.retry.base_delay_secs <= 0.0 || self.retry.max_delay_secs <= 0.0 {
            return Err(EngineError::Configuration(
                "retry delays must be positive".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(EngineError::Configuration(
                "breaker.failure_threshold must be positive".to_string(),
            ));
        }
        if self.runner.command.trim().is_empty() {
            return Err(EngineError::Configuration(
                "runner.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn checkpoint_root(&self) -> PathBuf {
        self.checkpoint
            .root
            .clone()
            .unwrap_or_else(|| self.app.workspace().join(".hive/checkpoints"))
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, EngineError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            return Err(EngineError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder
        .build()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;
    c.try_deserialize()
        .map_err(|e| EngineError::Configuration(e.to_string()))
}
