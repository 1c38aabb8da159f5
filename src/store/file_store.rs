//! 文件持久化任务存储
//!
//! 内存索引 + 写穿 JSON 文件：启动时整体加载一次（未知状态直接拒绝，文件损坏
//! 则拒绝启动），每次修改后刷盘。所有写者都经过事务 API；`transition` 的
//! from 校验即是执行器抢占任务的 CAS，输掉竞争的一方收到 `Conflict`。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::error::EngineError;
use crate::core::events::ProgressSink;
use crate::store::task::{transition_allowed, Task, TaskId, TaskStatus};

/// 存储文件的顶层结构
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tasks: Vec<Task>,
}

const STORE_FILE_VERSION: u32 = 1;
/// 乐观并发冲突的内部重试次数
const CAS_RETRIES: u32 = 3;

/// 各状态任务计数（观测用）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed + self.blocked
    }
}

/// 文件持久化任务存储
pub struct TaskStore {
    path: Option<PathBuf>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("path", &self.path)
            .field("has_progress_sink", &self.progress.is_some())
            .finish()
    }
}

impl TaskStore {
    /// 打开（或新建）存储文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let tasks = if tokio::fs::metadata(&path).await.is_ok() {
            let raw = tokio::fs::read_to_string(&path).await?;
            let file: StoreFile = serde_json::from_str(&raw).map_err(|e| {
                EngineError::Configuration(format!(
                    "task store corrupted at {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let mut map = HashMap::with_capacity(file.tasks.len());
            for task in file.tasks {
                if map.insert(task.id.clone(), task).is_some() {
                    return Err(EngineError::Configuration(format!(
                        "task store corrupted at {}: duplicate task id",
                        path.display()
                    )));
                }
            }
            // 依赖必须指向已存在的任务
            for task in map.values() {
                for dep in &task.dependencies {
                    if !map.contains_key(dep) {
                        return Err(EngineError::Configuration(format!(
                            "task '{}' depends on unknown task '{}'",
                            task.id, dep
                        )));
                    }
                }
            }
            map
        } else {
            HashMap::new()
        };

        tracing::info!(path = %path.display(), tasks = tasks.len(), "task store loaded");
        Ok(Self {
            path: Some(path),
            tasks: RwLock::new(tasks),
            progress: None,
        })
    }

    /// 纯内存实例（测试用）
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tasks: RwLock::new(HashMap::new()),
            progress: None,
        }
    }

    /// 挂接状态迁移观察者
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn get(&self, id: &str) -> Result<Task, EngineError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    /// 覆盖写入（已存在则整体替换并递增版本）
    pub async fn put(&self, mut task: Task) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        task.updated_at = chrono::Utc::now().timestamp_millis();
        task.version += 1;
        tasks.insert(task.id.clone(), task);
        self.persist(&tasks).await
    }

    /// 新增任务；id 已存在时报冲突（复查轮追加用）
    pub async fn insert(&self, task: Task) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(EngineError::Conflict(format!(
                "task '{}' already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task);
        self.persist(&tasks).await
    }

    pub async fn list(&self) -> Vec<Task> {
        let mut all: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut hits: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    pub async fn counts(&self) -> StatusCounts {
        let tasks = self.tasks.read().await;
        let mut counts = StatusCounts::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// 事务性状态迁移
    ///
    /// - 当前状态 != `from` → `Conflict`（调用方输掉了竞争，跳过即可）
    /// - (from, to) 不在白名单 → `InvalidTransition`
    /// - `from == to` → 无操作，返回当前记录
    pub async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task, EngineError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if task.status != from {
            return Err(EngineError::Conflict(format!(
                "task '{}' is {:?}, expected {:?}",
                id, task.status, from
            )));
        }
        if !transition_allowed(from, to) {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }
        if from == to {
            return Ok(task.clone());
        }

        task.status = to;
        mutate(task);
        task.updated_at = chrono::Utc::now().timestamp_millis();
        task.version += 1;
        let updated = task.clone();
        self.persist(&tasks).await?;
        drop(tasks);

        if let Some(progress) = &self.progress {
            progress.transition(id, from, to);
        }
        Ok(updated)
    }

    /// 非状态字段的乐观并发更新：版本冲突时内部重试，超过次数才上浮 `Conflict`
    pub async fn update(
        &self,
        id: &str,
        mutate: impl Fn(&mut Task),
    ) -> Result<Task, EngineError> {
        for _ in 0..CAS_RETRIES {
            let expected = {
                let tasks = self.tasks.read().await;
                tasks
                    .get(id)
                    .map(|t| t.version)
                    .ok_or_else(|| EngineError::NotFound(id.to_string()))?
            };

            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if task.version != expected {
                continue; // 读写间隙被他人修改，重试
            }
            mutate(task);
            task.updated_at = chrono::Utc::now().timestamp_millis();
            task.version += 1;
            let updated = task.clone();
            self.persist(&tasks).await?;
            return Ok(updated);
        }
        Err(EngineError::Conflict(format!(
            "task '{}' kept changing under concurrent updates",
            id
        )))
    }

    /// 批量替换：全部记录的版本都必须匹配，原子应用
    pub async fn batch_update(&self, records: Vec<Task>) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write().await;
        for record in &records {
            let current = tasks
                .get(&record.id)
                .ok_or_else(|| EngineError::NotFound(record.id.clone()))?;
            if current.version != record.version {
                return Err(EngineError::Conflict(format!(
                    "task '{}' version mismatch: {} != {}",
                    record.id, current.version, record.version
                )));
            }
        }
        let now = chrono::Utc::now().timestamp_millis();
        for mut record in records {
            record.updated_at = now;
            record.version += 1;
            tasks.insert(record.id.clone(), record);
        }
        self.persist(&tasks).await
    }

    /// 刷盘（关闭前显式调用一次）
    pub async fn flush(&self) -> Result<(), EngineError> {
        let tasks = self.tasks.read().await;
        self.persist(&tasks).await
    }

    async fn persist(&self, tasks: &HashMap<TaskId, Task>) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut sorted: Vec<&Task> = tasks.values().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        let file = StoreFile {
            version: STORE_FILE_VERSION,
            tasks: sorted.into_iter().cloned().collect(),
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| EngineError::Configuration(format!("task store serialize: {e}")))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::task::TaskPriority;
    use tempfile::TempDir;

    fn task(id: &str) -> Task {
        Task::new(id, format!("task {id}"), "do something")
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.json")).await.unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_then_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        {
            let store = TaskStore::open(&path).await.unwrap();
            store
                .put(task("a").with_priority(TaskPriority::High))
                .await
                .unwrap();
            store.put(task("b").with_dependencies(vec!["a".into()])).await.unwrap();
        }
        let store = TaskStore::open(&path).await.unwrap();
        let all = store.list().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].priority, TaskPriority::High);
        assert_eq!(all[1].dependencies, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupted_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let err = TaskStore::open(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        let file = serde_json::json!({
            "version": 1,
            "tasks": [{
                "id": "a", "title": "x", "description": "y",
                "dependencies": ["ghost"],
                "created_at": 0, "updated_at": 0
            }]
        });
        tokio::fs::write(&path, file.to_string()).await.unwrap();
        let err = TaskStore::open(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_transition_happy_path() {
        let store = TaskStore::in_memory();
        store.put(task("a")).await.unwrap();

        store
            .transition("a", TaskStatus::Pending, TaskStatus::Ready, |_| {})
            .await
            .unwrap();
        let updated = store
            .transition("a", TaskStatus::Ready, TaskStatus::Running, |t| {
                t.attempts += 0;
            })
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_transition_lost_race_is_conflict() {
        let store = TaskStore::in_memory();
        store.put(task("a")).await.unwrap();
        store
            .transition("a", TaskStatus::Pending, TaskStatus::Ready, |_| {})
            .await
            .unwrap();
        store
            .transition("a", TaskStatus::Ready, TaskStatus::Running, |_| {})
            .await
            .unwrap();

        // 第二个执行器用同样的 from 再抢占，必须收到 Conflict
        let err = store
            .transition("a", TaskStatus::Ready, TaskStatus::Running, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transition_same_state_is_noop() {
        let store = TaskStore::in_memory();
        store.put(task("a")).await.unwrap();
        let before = store.get("a").await.unwrap();
        let after = store
            .transition("a", TaskStatus::Pending, TaskStatus::Pending, |t| {
                t.attempts = 99; // 无操作路径不得执行 mutator
            })
            .await
            .unwrap();
        assert_eq!(before.attempts, after.attempts);
        assert_eq!(before.version, after.version);
    }

    #[tokio::test]
    async fn test_disallowed_transition() {
        let store = TaskStore::in_memory();
        let mut t = task("a");
        t.status = TaskStatus::Completed;
        store.put(t).await.unwrap();

        let err = store
            .transition("a", TaskStatus::Completed, TaskStatus::Running, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_insert_duplicate_rejected() {
        let store = TaskStore::in_memory();
        store.insert(task("a")).await.unwrap();
        let err = store.insert(task("a")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_batch_update_version_mismatch() {
        let store = TaskStore::in_memory();
        store.put(task("a")).await.unwrap();
        let mut stale = store.get("a").await.unwrap();
        store.update("a", |t| t.attempts += 1).await.unwrap();

        stale.title = "renamed".to_string();
        let err = store.batch_update(vec![stale]).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_counts() {
        let store = TaskStore::in_memory();
        store.put(task("a")).await.unwrap();
        store.put(task("b")).await.unwrap();
        store
            .transition("b", TaskStatus::Pending, TaskStatus::Ready, |_| {})
            .await
            .unwrap();

        let counts = store.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.total(), 2);
    }
}
