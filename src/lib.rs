//! Hive - 驱动外部 LLM CLI 的并行任务编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 引擎装配、错误分类、事件端口、优雅关闭
//! - **store**: 任务模型与文件持久化任务存储
//! - **planner**: 依赖图、确定性拓扑排序、就绪前沿调度、复查轮
//! - **pool**: 有界执行器池、熔断器、重试策略
//! - **runner**: 外部 LLM CLI 子进程端口（真实 / 脚本化测试替身）
//! - **checkpoint**: 按步快照存储，崩溃后恢复
//! - **budget**: Token 预算准入与用量统计
//! - **observability**: tracing 初始化与引擎指标

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod observability;
pub mod planner;
pub mod pool;
pub mod runner;
pub mod store;
