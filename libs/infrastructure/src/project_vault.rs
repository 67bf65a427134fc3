//! # ProjectVault — アーティファクト保管庫
//!
//! `data_dir` 配下のオンディスク・レイアウトを一元管理する。
//!
//! ```text
//! data/
//!   projects/<task_id>/          剧本スナップショット・画像・成果物
//!   projects/<task_id>/images/   ショット画像 (shot_001.png ...)
//!   assets/bgm/                  BGM 素材
//! ```

use loom_core::error::LoomError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Clone)]
pub struct ProjectVault {
    data_dir: PathBuf,
}

impl ProjectVault {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn project_dir(&self, task_id: &str) -> PathBuf {
        self.data_dir.join("projects").join(task_id)
    }

    pub fn images_dir(&self, task_id: &str) -> PathBuf {
        self.project_dir(task_id).join("images")
    }

    /// プロジェクトディレクトリ (images/ 含む) を作成する
    pub async fn ensure_project(&self, task_id: &str) -> Result<PathBuf, LoomError> {
        let dir = self.project_dir(task_id);
        tokio::fs::create_dir_all(self.images_dir(task_id))
            .await
            .map_err(|e| LoomError::Storage {
                reason: format!("Failed to create project directory {}: {}", dir.display(), e),
            })?;
        Ok(dir)
    }

    /// タスクの全アーティファクトを削除する。存在しなければ何もしない。
    pub async fn remove_project(&self, task_id: &str) -> Result<(), LoomError> {
        let dir = self.project_dir(task_id);
        if !dir.exists() {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| LoomError::Storage {
                reason: format!("Failed to remove project directory {}: {}", dir.display(), e),
            })
    }

    /// JSON スナップショットを整形保存する。失敗は呼び出し側で warn に留めてよい。
    pub async fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), LoomError> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| LoomError::Storage {
            reason: format!("Failed to serialize snapshot: {e}"),
        })?;
        tokio::fs::write(path, body)
            .await
            .map_err(|e| LoomError::Storage {
                reason: format!("Failed to write {}: {}", path.display(), e),
            })
    }

    pub async fn file_size(&self, path: &Path) -> u64 {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("📦 ProjectVault: Failed to stat {}: {}", path.display(), e);
                0
            }
        }
    }

    /// BGM 名を assets/bgm/ 配下の実ファイルに解決する。無ければ None。
    pub fn resolve_bgm(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        let path = self.data_dir.join("assets").join("bgm").join(name);
        if path.exists() {
            Some(path)
        } else {
            warn!("📦 ProjectVault: BGM not found, rendering without audio: {}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_and_remove_project() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = ProjectVault::new(tmp.path());

        let dir = vault.ensure_project("t-1").await.unwrap();
        assert!(dir.ends_with("projects/t-1"));
        assert!(vault.images_dir("t-1").exists());

        vault.remove_project("t-1").await.unwrap();
        assert!(!dir.exists());

        // 既に消えているプロジェクトの削除は no-op
        vault.remove_project("t-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_save_json_and_file_size() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = ProjectVault::new(tmp.path());
        vault.ensure_project("t-2").await.unwrap();

        let path = vault.project_dir("t-2").join("parsed.json");
        vault
            .save_json(&path, &serde_json::json!({"scenes": []}))
            .await
            .unwrap();
        assert!(vault.file_size(&path).await > 0);
        assert_eq!(vault.file_size(Path::new("/nonexistent")).await, 0);
    }

    #[tokio::test]
    async fn test_resolve_bgm() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = ProjectVault::new(tmp.path());

        assert!(vault.resolve_bgm("").is_none());
        assert!(vault.resolve_bgm("missing.mp3").is_none());

        let bgm_dir = tmp.path().join("assets").join("bgm");
        std::fs::create_dir_all(&bgm_dir).unwrap();
        std::fs::write(bgm_dir.join("calm.mp3"), b"riff").unwrap();
        assert!(vault.resolve_bgm("calm.mp3").is_some());
    }
}
