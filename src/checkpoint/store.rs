//! 快照文件存储
//!
//! 布局：根目录下按状态分区 active/ completed/ failed/，一快照一文件；
//! index 是追加写的 JSON 行（task_id → checkpoint_id），损坏时从目录扫描重建。
//! 所有写入先落临时文件再重命名，保证原子性。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::checkpoint::record::{CheckpointRecord, CheckpointState};
use crate::core::error::EngineError;

/// 落盘形态：记录 + 内容校验和
#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    checksum: String,
    record: CheckpointRecord,
}

/// index 的一行
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    task_id: String,
    checkpoint_id: String,
}

const PARTITIONS: [&str; 3] = ["active", "completed", "failed"];

/// 快照存储
pub struct CheckpointStore {
    root: PathBuf,
    /// task_id → 创建序的 checkpoint id 列表
    index: Mutex<HashMap<String, Vec<String>>>,
}

impl CheckpointStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, EngineError> {
        let root = root.as_ref().to_path_buf();
        for partition in PARTITIONS {
            tokio::fs::create_dir_all(root.join(partition)).await?;
        }
        let store = Self {
            root,
            index: Mutex::new(HashMap::new()),
        };
        store.load_index().await?;
        Ok(store)
    }

    async fn load_index(&self) -> Result<(), EngineError> {
        let path = self.index_path();
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let mut consistent = true;
                for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<IndexEntry>(line) {
                        Ok(entry) => index
                            .entry(entry.task_id)
                            .or_default()
                            .push(entry.checkpoint_id),
                        Err(e) => {
                            tracing::warn!("checkpoint index line unreadable ({e}), rebuilding");
                            consistent = false;
                            break;
                        }
                    }
                }
                if !consistent {
                    index = self.rebuild_index().await?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *self.index.lock().await = index;
        Ok(())
    }

    /// 目录扫描重建 index（一致性检查失败时）
    async fn rebuild_index(&self) -> Result<HashMap<String, Vec<String>>, EngineError> {
        let mut records = Vec::new();
        for partition in PARTITIONS {
            let dir = self.root.join(partition);
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match self.read_record(&entry.path()).await {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(path = %entry.path().display(), "skipping unreadable checkpoint during rebuild: {e}");
                    }
                }
            }
        }
        records.sort_by_key(|r| (r.created_at, r.checkpoint_id.clone()));

        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        let mut lines = String::new();
        for record in &records {
            index
                .entry(record.task_id.clone())
                .or_default()
                .push(record.checkpoint_id.clone());
            let entry = IndexEntry {
                task_id: record.task_id.clone(),
                checkpoint_id: record.checkpoint_id.clone(),
            };
            lines.push_str(&serde_json::to_string(&entry).expect("index entry serializes"));
            lines.push('\n');
        }
        self.write_atomic(&self.index_path(), lines.as_bytes()).await?;
        tracing::info!(checkpoints = records.len(), "checkpoint index rebuilt");
        Ok(index)
    }

    /// 新建快照；重复 id 直接拒绝，不静默覆盖
    pub async fn create(
        &self,
        task_id: &str,
        step_number: u32,
        step_description: &str,
        data: serde_json::Value,
        parent: Option<String>,
    ) -> Result<CheckpointRecord, EngineError> {
        let record = CheckpointRecord::new(task_id, step_number, step_description, data, parent);
        self.create_record(record).await
    }

    /// 写入一条现成的记录（恢复测试需要可控时间戳）
    pub async fn create_record(
        &self,
        record: CheckpointRecord,
    ) -> Result<CheckpointRecord, EngineError> {
        if self.locate(&record.checkpoint_id).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "checkpoint '{}' already exists",
                record.checkpoint_id
            )));
        }
        self.save(&record).await?;

        let entry = IndexEntry {
            task_id: record.task_id.clone(),
            checkpoint_id: record.checkpoint_id.clone(),
        };
        self.append_index(&entry).await?;
        self.index
            .lock()
            .await
            .entry(record.task_id.clone())
            .or_default()
            .push(record.checkpoint_id.clone());

        tracing::debug!(
            checkpoint_id = %record.checkpoint_id,
            task_id = %record.task_id,
            step = record.step_number,
            "checkpoint created"
        );
        Ok(record)
    }

    /// CREATED → ACTIVE
    pub async fn activate(&self, checkpoint_id: &str) -> Result<CheckpointRecord, EngineError> {
        self.transition(checkpoint_id, CheckpointState::Active, None).await
    }

    /// 更新载荷 / 描述（仅 ACTIVE）
    pub async fn update(
        &self,
        checkpoint_id: &str,
        data: serde_json::Value,
    ) -> Result<CheckpointRecord, EngineError> {
        let (path, mut record) = self.load(checkpoint_id).await?;
        if record.state != CheckpointState::Active {
            return Err(EngineError::Conflict(format!(
                "checkpoint '{}' is {:?}, only ACTIVE checkpoints can be updated",
                checkpoint_id, record.state
            )));
        }
        merge_data(&mut record.data, data);
        record.touch();
        self.save_at(&path, &record).await?;
        Ok(record)
    }

    /// ACTIVE → COMPLETED
    pub async fn complete(
        &self,
        checkpoint_id: &str,
        final_data: Option<serde_json::Value>,
    ) -> Result<CheckpointRecord, EngineError> {
        self.transition(checkpoint_id, CheckpointState::Completed, final_data)
            .await
    }

    /// ACTIVE → FAILED
    pub async fn fail(
        &self,
        checkpoint_id: &str,
        error: &str,
    ) -> Result<CheckpointRecord, EngineError> {
        self.transition(
            checkpoint_id,
            CheckpointState::Failed,
            Some(serde_json::json!({ "error": error })),
        )
        .await
    }

    /// FAILED → RESTORED（文件回到 active/ 分区）
    pub async fn restore(&self, checkpoint_id: &str) -> Result<CheckpointRecord, EngineError> {
        self.transition(checkpoint_id, CheckpointState::Restored, None)
            .await
    }

    async fn transition(
        &self,
        checkpoint_id: &str,
        to: CheckpointState,
        extra_data: Option<serde_json::Value>,
    ) -> Result<CheckpointRecord, EngineError> {
        let (path, mut record) = self.load(checkpoint_id).await?;
        if !record.state.can_transition(to) {
            return Err(EngineError::Conflict(format!(
                "checkpoint '{}' cannot go {:?} -> {:?}",
                checkpoint_id, record.state, to
            )));
        }
        record.state = to;
        if let Some(data) = extra_data {
            merge_data(&mut record.data, data);
        }
        record.touch();

        let new_path = self.partition_path(to).join(file_name(checkpoint_id));
        self.save_at(&new_path, &record).await?;
        if new_path != path {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(record)
    }

    /// 按 id 读取（任意分区）
    pub async fn get(&self, checkpoint_id: &str) -> Result<CheckpointRecord, EngineError> {
        let (_, record) = self.load(checkpoint_id).await?;
        Ok(record)
    }

    /// 任务的全部快照（创建序）
    pub async fn list_for_task(&self, task_id: &str) -> Result<Vec<CheckpointRecord>, EngineError> {
        let ids = self
            .index
            .lock()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok((_, record)) => records.push(record),
                Err(EngineError::NotFound(_)) => {} // 已被 gc
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// 任务最近一条快照
    pub async fn latest(&self, task_id: &str) -> Result<Option<CheckpointRecord>, EngineError> {
        Ok(self.list_for_task(task_id).await?.into_iter().last())
    }

    /// 任务最近一条未完成快照（恢复协议用）
    pub async fn latest_open(
        &self,
        task_id: &str,
    ) -> Result<Option<CheckpointRecord>, EngineError> {
        Ok(self
            .list_for_task(task_id)
            .await?
            .into_iter()
            .filter(|r| r.state != CheckpointState::Completed)
            .last())
    }

    /// 按龄回收：只清 completed/failed，返回删除数量
    pub async fn gc(&self, max_age: Duration) -> Result<usize, EngineError> {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut removed = 0;
        for partition in ["completed", "failed"] {
            let dir = self.root.join(partition);
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match self.read_record(&path).await {
                    Ok(record) if record.updated_at < cutoff => {
                        tokio::fs::remove_file(&path).await?;
                        let mut index = self.index.lock().await;
                        if let Some(ids) = index.get_mut(&record.task_id) {
                            ids.retain(|id| id != &record.checkpoint_id);
                        }
                        removed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "gc skipping unreadable checkpoint: {e}");
                    }
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "checkpoint gc finished");
        }
        Ok(removed)
    }

    async fn load(
        &self,
        checkpoint_id: &str,
    ) -> Result<(PathBuf, CheckpointRecord), EngineError> {
        let path = self
            .locate(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(checkpoint_id.to_string()))?;
        let record = self.read_record(&path).await?;
        Ok((path, record))
    }

    async fn read_record(&self, path: &Path) -> Result<CheckpointRecord, EngineError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let stored: StoredCheckpoint = serde_json::from_str(&raw).map_err(|e| {
            EngineError::CorruptCheckpoint(format!("{}: {e}", path.display()))
        })?;
        let actual = stored.record.checksum();
        if actual != stored.checksum {
            return Err(EngineError::CorruptCheckpoint(format!(
                "{}: checksum mismatch",
                path.display()
            )));
        }
        Ok(stored.record)
    }

    async fn locate(&self, checkpoint_id: &str) -> Result<Option<PathBuf>, EngineError> {
        for partition in PARTITIONS {
            let path = self.root.join(partition).join(file_name(checkpoint_id));
            if tokio::fs::metadata(&path).await.is_ok() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), EngineError> {
        let partition = self.partition_path(record.state);
        let path = partition.join(file_name(&record.checkpoint_id));
        self.save_at(&path, record).await
    }

    async fn save_at(&self, path: &Path, record: &CheckpointRecord) -> Result<(), EngineError> {
        let stored = StoredCheckpoint {
            checksum: record.checksum(),
            record: record.clone(),
        };
        let raw = serde_json::to_string_pretty(&stored)
            .map_err(|e| EngineError::CorruptCheckpoint(format!("serialize: {e}")))?;
        self.write_atomic(path, raw.as_bytes()).await
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn append_index(&self, entry: &IndexEntry) -> Result<(), EngineError> {
        let line = format!(
            "{}\n",
            serde_json::to_string(entry).expect("index entry serializes")
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    fn partition_path(&self, state: CheckpointState) -> PathBuf {
        let partition = match state {
            CheckpointState::Completed => "completed",
            CheckpointState::Failed => "failed",
            // CREATED / ACTIVE / RESTORED 都算活动快照
            _ => "active",
        };
        self.root.join(partition)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index")
    }
}

fn file_name(checkpoint_id: &str) -> String {
    format!("{checkpoint_id}.json")
}

fn merge_data(target: &mut serde_json::Value, incoming: serde_json::Value) {
    match (target, incoming) {
        (serde_json::Value::Object(t), serde_json::Value::Object(i)) => {
            for (k, v) in i {
                t.insert(k, v);
            }
        }
        (t, i) => *t = i,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_activate_complete_moves_partitions() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;
        let record = cp
            .create("t1", 1, "first step", serde_json::json!({}), None)
            .await
            .unwrap();

        assert!(dir
            .path()
            .join("active")
            .join(format!("{}.json", record.checkpoint_id))
            .exists());

        cp.activate(&record.checkpoint_id).await.unwrap();
        cp.complete(&record.checkpoint_id, Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();

        assert!(dir
            .path()
            .join("completed")
            .join(format!("{}.json", record.checkpoint_id))
            .exists());
        assert!(!dir
            .path()
            .join("active")
            .join(format!("{}.json", record.checkpoint_id))
            .exists());
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;
        let record = cp
            .create("t1", 1, "step", serde_json::json!({}), None)
            .await
            .unwrap();
        // CREATED → COMPLETED 非法
        let err = cp.complete(&record.checkpoint_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;
        let record = cp
            .create("t1", 1, "step", serde_json::json!({}), None)
            .await
            .unwrap();
        let err = cp.create_record(record).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_fail_then_restore_back_to_active() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;
        let record = cp
            .create("t1", 1, "step", serde_json::json!({}), None)
            .await
            .unwrap();
        cp.activate(&record.checkpoint_id).await.unwrap();
        cp.fail(&record.checkpoint_id, "tool exploded").await.unwrap();

        let restored = cp.restore(&record.checkpoint_id).await.unwrap();
        assert_eq!(restored.state, CheckpointState::Restored);
        assert!(dir
            .path()
            .join("active")
            .join(format!("{}.json", record.checkpoint_id))
            .exists());
        // 失败原因保留在载荷里
        assert_eq!(restored.data["error"], "tool exploded");
    }

    #[tokio::test]
    async fn test_latest_open_skips_completed() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;
        let first = cp
            .create("t1", 1, "step one", serde_json::json!({}), None)
            .await
            .unwrap();
        cp.activate(&first.checkpoint_id).await.unwrap();
        cp.complete(&first.checkpoint_id, None).await.unwrap();

        assert!(cp.latest_open("t1").await.unwrap().is_none());

        let second = cp
            .create("t1", 2, "step two", serde_json::json!({}), None)
            .await
            .unwrap();
        cp.activate(&second.checkpoint_id).await.unwrap();

        let open = cp.latest_open("t1").await.unwrap().unwrap();
        assert_eq!(open.checkpoint_id, second.checkpoint_id);
        // latest 看到的也是第二条
        assert_eq!(
            cp.latest("t1").await.unwrap().unwrap().checkpoint_id,
            second.checkpoint_id
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;
        let record = cp
            .create("t1", 1, "step", serde_json::json!({}), None)
            .await
            .unwrap();

        let path = dir
            .path()
            .join("active")
            .join(format!("{}.json", record.checkpoint_id));
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let tampered = raw.replace("step", "tampered step");
        tokio::fs::write(&path, tampered).await.unwrap();

        let err = cp.get(&record.checkpoint_id).await.unwrap_err();
        assert!(matches!(err, EngineError::CorruptCheckpoint(_)));
    }

    #[tokio::test]
    async fn test_index_rebuild_on_corruption() {
        let dir = TempDir::new().unwrap();
        let id = {
            let cp = store(&dir).await;
            let record = cp
                .create("t1", 1, "step", serde_json::json!({}), None)
                .await
                .unwrap();
            record.checkpoint_id
        };

        tokio::fs::write(dir.path().join("index"), "%% not json lines %%")
            .await
            .unwrap();

        let cp = store(&dir).await;
        let latest = cp.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, id);
    }

    #[tokio::test]
    async fn test_gc_removes_only_old_settled() {
        let dir = TempDir::new().unwrap();
        let cp = store(&dir).await;

        let old = cp
            .create("t1", 1, "old", serde_json::json!({}), None)
            .await
            .unwrap();
        cp.activate(&old.checkpoint_id).await.unwrap();
        cp.complete(&old.checkpoint_id, None).await.unwrap();

        let live = cp
            .create("t1", 2, "live", serde_json::json!({}), None)
            .await
            .unwrap();
        cp.activate(&live.checkpoint_id).await.unwrap();

        // max_age = 0：所有已终结的都过期，活动的不动
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = cp.gc(Duration::from_millis(0)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cp.get(&old.checkpoint_id).await.is_err());
        assert!(cp.get(&live.checkpoint_id).await.is_ok());
    }
}
