//! # ImageAtelier — Stable Diffusion 作画クライアント
//!
//! SD WebUI の txt2img API でショット画像を1枚ずつ生成する。
//! GPU メモリを使い切らないよう生成は直列。ショット完了ごとに
//! 進捗フックを await し、呼び出し側の永続化を待ってから次へ進む。

use crate::project_vault::ProjectVault;
use crate::script_scribe::NEGATIVE_PROMPT;
use async_trait::async_trait;
use base64::Engine;
use loom_core::contracts::Storyboard;
use loom_core::error::LoomError;
use loom_core::traits::{ProgressHook, ShotIllustrator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ImageAtelier {
    http: reqwest::Client,
    api_url: String,
    width: u32,
    height: u32,
    vault: Arc<ProjectVault>,
}

#[derive(Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    sampler_name: &'a str,
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    images: Vec<String>,
}

impl ImageAtelier {
    pub fn new(
        api_url: impl Into<String>,
        timeout_secs: u64,
        width: u32,
        height: u32,
        vault: Arc<ProjectVault>,
    ) -> Result<Self, LoomError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LoomError::ImageBackend {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            width,
            height,
            vault,
        })
    }

    /// SD WebUI の疎通確認
    pub async fn health_check(&self) -> Result<(), LoomError> {
        let url = format!("{}/sdapi/v1/options", self.api_url.trim_end_matches('/'));
        let resp = self.http.get(&url).send().await.map_err(|e| LoomError::ImageBackend {
            reason: format!("SD API unreachable at {}: {}", self.api_url, e),
        })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(LoomError::ImageBackend {
                reason: format!("SD API health check returned status {}", resp.status()),
            })
        }
    }

    async fn generate_one(&self, prompt: &str) -> Result<Vec<u8>, LoomError> {
        let req = Txt2ImgRequest {
            prompt,
            negative_prompt: NEGATIVE_PROMPT,
            steps: 30,
            cfg_scale: 7.5,
            width: self.width,
            height: self.height,
            sampler_name: "DPM++ 2M Karras",
        };

        let url = format!("{}/sdapi/v1/txt2img", self.api_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| LoomError::ImageBackend {
                reason: format!("SD API call failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LoomError::ImageBackend {
                reason: format!("SD API returned status {status}: {body}"),
            });
        }

        let result: Txt2ImgResponse = resp.json().await.map_err(|e| LoomError::ImageBackend {
            reason: format!("Failed to decode SD response: {e}"),
        })?;
        let first = result.images.first().ok_or_else(|| LoomError::ImageBackend {
            reason: "no image generated".to_string(),
        })?;

        base64::engine::general_purpose::STANDARD
            .decode(first)
            .map_err(|e| LoomError::ImageBackend {
                reason: format!("Failed to decode base64 image: {e}"),
            })
    }
}

#[async_trait]
impl ShotIllustrator for ImageAtelier {
    async fn illustrate_all(
        &self,
        task_id: &str,
        storyboard: &mut Storyboard,
        on_progress: ProgressHook,
    ) -> Result<(), LoomError> {
        let total = storyboard.shots.len();
        info!("🎨 ImageAtelier: Generating {} shot images (task: {})", total, task_id);

        self.vault.ensure_project(task_id).await?;
        let images_dir = self.vault.images_dir(task_id);

        for (i, shot) in storyboard.shots.iter_mut().enumerate() {
            info!(
                "🎨 ImageAtelier: Shot {}/{} (id: {}, task: {})",
                i + 1,
                total,
                shot.id,
                task_id
            );

            let image_data = self.generate_one(&shot.prompt).await.map_err(|e| {
                LoomError::ImageBackend {
                    reason: format!("failed to generate image for shot {}: {}", shot.id, e),
                }
            })?;

            let image_path = images_dir.join(format!("shot_{:03}.png", shot.id));
            tokio::fs::write(&image_path, &image_data)
                .await
                .map_err(|e| LoomError::Storage {
                    reason: format!("Failed to save image {}: {}", image_path.display(), e),
                })?;
            shot.image_path = image_path.to_string_lossy().to_string();

            // 永続化が終わるまで次のショットには進まない
            on_progress(i + 1, total).await;
        }

        // 画像パス込みの分鏡スナップショットを保存する
        let storyboard_path = self.vault.project_dir(task_id).join("storyboard.json");
        if let Err(e) = self.vault.save_json(&storyboard_path, storyboard).await {
            warn!("🎨 ImageAtelier: Failed to save enriched storyboard: {}", e);
        }

        info!("🎨 ImageAtelier: All {} shots illustrated (task: {})", total, task_id);
        Ok(())
    }
}
