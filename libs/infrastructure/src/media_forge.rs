//! # MediaForge — FFmpeg 動画合成エンジン
//!
//! ショット画像を concat demuxer で連結し、各ショットの尺どおりに
//! 静止画スライドショーの動画を書き出す。BGM が解決できた場合のみ
//! 音声トラックを焼き込む。

use crate::project_vault::ProjectVault;
use async_trait::async_trait;
use loom_core::contracts::{RenderResult, Storyboard};
use loom_core::error::LoomError;
use loom_core::traits::VideoAssembler;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Clone)]
pub struct MediaForge {
    fps: u32,
    /// 設定由来の公称解像度 ("1920x1080")。実測はしない。
    resolution: String,
    vault: Arc<ProjectVault>,
}

impl MediaForge {
    pub fn new(fps: u32, resolution: impl Into<String>, vault: Arc<ProjectVault>) -> Self {
        Self {
            fps,
            resolution: resolution.into(),
            vault,
        }
    }

    /// ffmpeg がインストールされているかを確認する
    pub async fn check_installed() -> Result<(), LoomError> {
        let output = Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await
            .map_err(|e| LoomError::FfmpegFailed {
                reason: format!("ffmpeg not found in PATH: {e}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(LoomError::FfmpegFailed {
                reason: "ffmpeg -version exited with failure".to_string(),
            })
        }
    }

    /// concat demuxer 用の入力リストを組み立てる。
    ///
    /// ```text
    /// file 'images/shot_001.png'
    /// duration 4.0
    /// ...
    /// file 'images/shot_010.png'   (最終フレーム保持のため末尾を再掲)
    /// ```
    fn build_concat_list(storyboard: &Storyboard) -> Result<String, LoomError> {
        let mut list = String::new();
        for shot in &storyboard.shots {
            if shot.image_path.is_empty() {
                return Err(LoomError::FfmpegFailed {
                    reason: format!("shot {} has no generated image", shot.id),
                });
            }
            list.push_str(&format!("file '{}'\n", shot.image_path));
            list.push_str(&format!("duration {}\n", shot.duration));
        }
        if let Some(last) = storyboard.shots.last() {
            list.push_str(&format!("file '{}'\n", last.image_path));
        }
        Ok(list)
    }

    async fn run_ffmpeg(cmd: &mut Command, what: &str) -> Result<(), LoomError> {
        let output = cmd.output().await.map_err(|e| LoomError::FfmpegFailed {
            reason: format!("Failed to spawn ffmpeg ({what}): {e}"),
        })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            Err(LoomError::FfmpegFailed {
                reason: format!("ffmpeg {what} failed: {tail}"),
            })
        }
    }

    /// サムネイル生成。失敗しても成果物は有効なので warn に留める。
    async fn extract_thumbnail(&self, video: &Path, thumbnail: &Path) -> Option<String> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(video)
            .arg("-vframes")
            .arg("1")
            .arg("-ss")
            .arg("0")
            .arg(thumbnail);
        match Self::run_ffmpeg(&mut cmd, "thumbnail").await {
            Ok(()) => Some(thumbnail.to_string_lossy().to_string()),
            Err(e) => {
                warn!("🎬 MediaForge: Thumbnail extraction failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl VideoAssembler for MediaForge {
    async fn assemble(
        &self,
        task_id: &str,
        storyboard: &Storyboard,
        bgm: Option<&str>,
    ) -> Result<RenderResult, LoomError> {
        if storyboard.shots.is_empty() {
            return Err(LoomError::FfmpegFailed {
                reason: "storyboard has no shots to render".to_string(),
            });
        }

        let project_dir = self.vault.ensure_project(task_id).await?;
        let list_path = project_dir.join("concat_list.txt");
        let output_path = project_dir.join("output.mp4");

        let concat_list = Self::build_concat_list(storyboard)?;
        tokio::fs::write(&list_path, concat_list)
            .await
            .map_err(|e| LoomError::Storage {
                reason: format!("Failed to write concat list: {e}"),
            })?;

        let bgm_path = bgm.and_then(|name| self.vault.resolve_bgm(name));
        info!(
            "🎬 MediaForge: Rendering {} shots -> {} (task: {}, bgm: {})",
            storyboard.shots.len(),
            output_path.display(),
            task_id,
            bgm_path.is_some()
        );

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&list_path);
        if let Some(bgm) = &bgm_path {
            cmd.arg("-i").arg(bgm);
        }
        cmd.arg("-c:v")
            .arg("libx264")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-r")
            .arg(self.fps.to_string())
            .arg("-preset")
            .arg("medium")
            .arg("-crf")
            .arg("23");
        if bgm_path.is_some() {
            // BGM は動画尺で打ち切る
            cmd.arg("-c:a").arg("aac").arg("-b:a").arg("192k").arg("-shortest");
        }
        cmd.arg(&output_path);

        Self::run_ffmpeg(&mut cmd, "render").await?;

        let file_size = self.vault.file_size(&output_path).await;
        let thumbnail_path = self
            .extract_thumbnail(&output_path, &project_dir.join("thumbnail.png"))
            .await;

        info!(
            "🎬 MediaForge: Render complete (task: {}, size: {} bytes)",
            task_id, file_size
        );
        Ok(RenderResult {
            video_path: output_path.to_string_lossy().to_string(),
            duration: storyboard.total_duration,
            resolution: self.resolution.clone(),
            file_size,
            thumbnail_path,
            shot_count: storyboard.shots.len(),
        })
    }
}
