//! # TaskRegistry — インメモリ・タスクレジストリ
//!
//! 全タスクレコードの唯一の共有ストア。プロセス再起動をまたぐ永続化は
//! 行わない。read/write は単一の RwLock ドメインで直列化され、
//! 読み取り同士のみ並行に走る。

use loom_core::contracts::Task;
use loom_core::error::LoomError;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 並行アクセス安全なタスクストア
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 無条件挿入。ID の一意性は呼び出し側 (UUID v4) が保証する。
    pub async fn create(&self, task: Task) {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task);
    }

    /// スナップショットを返す。以後の並行更新からは隔離される。
    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).cloned()
    }

    /// 保存済みレコードを原子的に置き換える (last-write-wins)
    pub async fn update(&self, task: Task) -> Result<(), LoomError> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(LoomError::TaskNotFound {
                task_id: task.id.clone(),
            });
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub async fn delete(&self, task_id: &str) -> Result<(), LoomError> {
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_none() {
            return Err(LoomError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// 全タスクのスナップショット。順序は保証しない。
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks.values().cloned().collect()
    }
}
