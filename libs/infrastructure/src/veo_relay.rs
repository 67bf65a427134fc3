//! # VeoRelay — 文生視頻 API クライアント (直行パス)
//!
//! 分鏡全体を1つのプロンプトに畳み込み、Veo 互換 API へ submit →
//! 完了待ちポーリング → 成果物ダウンロードまでを1回の呼び出しで行う。
//! プロバイダは現状 8秒クリップしか受け付けないため、要求尺は設定の
//! `veo_clip_secs` をそのまま使う。

use crate::project_vault::ProjectVault;
use async_trait::async_trait;
use loom_core::contracts::{GeneratedClip, Storyboard};
use loom_core::error::LoomError;
use loom_core::traits::DirectVideoGenerator;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct VeoRelay {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    clip_secs: u32,
    poll_interval: Duration,
    max_wait: Duration,
    vault: Arc<ProjectVault>,
}

// --- Veo API ワイヤ形式 ---

#[derive(Serialize)]
struct GenerateRequest<'a> {
    instances: Vec<Instance<'a>>,
    parameters: Parameters,
    model: &'a str,
}

#[derive(Serialize)]
struct Instance<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
struct Parameters {
    #[serde(rename = "generateAudio")]
    generate_audio: bool,
    #[serde(rename = "durationSeconds")]
    duration_seconds: u32,
    #[serde(rename = "sampleCount")]
    sample_count: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<GenerationData>,
}

#[derive(Deserialize)]
struct GenerationData {
    #[serde(default)]
    videos: Vec<VideoAsset>,
}

#[derive(Deserialize)]
struct VideoAsset {
    url: String,
}

/// 1回のポーリングで観測した外部ジョブの状態
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: String,
    pub message: Option<String>,
    pub asset_url: Option<String>,
}

/// ステータス文字列の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Running,
    Succeeded,
    Failed,
}

/// プロバイダのステータス語彙を大文字小文字を無視して分類する
pub fn classify(status: &str) -> Verdict {
    match status.to_ascii_lowercase().as_str() {
        "completed" | "succeeded" | "success" => Verdict::Succeeded,
        "failed" | "error" => Verdict::Failed,
        _ => Verdict::Running,
    }
}

/// 完了待ちポーリングループ。
///
/// - ポーリング失敗は一過性として warn のみで続行する
/// - 成功ステータスでも取得可能なアセットが無ければ失敗として扱う
/// - 期限超過時は試行回数を添えて `PollTimeout` を返す
/// - ポーリングの合間のキャンセルは即座に `Cancelled` を返す
pub async fn await_terminal<F, Fut>(
    mut poll: F,
    interval: Duration,
    max_wait: Duration,
    cancel: &CancellationToken,
) -> Result<StatusSnapshot, LoomError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<StatusSnapshot, LoomError>>,
{
    let deadline = Instant::now() + max_wait;
    let mut checks: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(LoomError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }

        checks += 1;
        if Instant::now() >= deadline {
            return Err(LoomError::PollTimeout {
                checks,
                waited_secs: max_wait.as_secs(),
            });
        }

        let snapshot = match poll().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // 単発のポーリング失敗は一過性とみなす
                warn!("🛰️ VeoRelay: Poll attempt {} failed: {}", checks, e);
                continue;
            }
        };

        match classify(&snapshot.status) {
            Verdict::Running => {
                // 1分以上キューに滞留している場合だけ知らせる
                if snapshot.status.eq_ignore_ascii_case("queued") && checks > 6 {
                    warn!("🛰️ VeoRelay: Provider queue congested ({} checks so far)", checks);
                }
            }
            Verdict::Succeeded => {
                if snapshot.asset_url.is_none() {
                    return Err(LoomError::VideoBackend {
                        reason: "generation reported success but returned no retrievable asset"
                            .to_string(),
                    });
                }
                return Ok(snapshot);
            }
            Verdict::Failed => {
                let reason = snapshot
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "unknown provider error".to_string());
                return Err(LoomError::VideoBackend { reason });
            }
        }
    }
}

impl VeoRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
        max_wait_secs: u64,
        poll_interval_secs: u64,
        clip_secs: u32,
        vault: Arc<ProjectVault>,
    ) -> Result<Self, LoomError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LoomError::VideoBackend {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            clip_secs,
            // レート制限対策: 設定値にかかわらず数秒未満のポーリングはしない
            poll_interval: Duration::from_secs(poll_interval_secs.max(3)),
            max_wait: Duration::from_secs(max_wait_secs),
            vault,
        })
    }

    /// API の疎通確認
    pub async fn health_check(&self) -> Result<(), LoomError> {
        self.http
            .get(&self.api_url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LoomError::VideoBackend {
                reason: format!("Veo API unreachable at {}: {}", self.api_url, e),
            })?;
        Ok(())
    }

    /// 生成ジョブを投入し、外部ジョブ ID を返す
    async fn submit(&self, prompt: &str) -> Result<String, LoomError> {
        let req = GenerateRequest {
            instances: vec![Instance { prompt }],
            parameters: Parameters {
                generate_audio: true,
                duration_seconds: self.clip_secs,
                sample_count: 1,
            },
            model: &self.model,
        };

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| LoomError::VideoBackend {
                reason: format!("Veo API call failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LoomError::VideoBackend {
                reason: format!("Veo API returned status {status}: {body}"),
            });
        }

        let parsed: GenerateResponse = resp.json().await.map_err(|e| LoomError::VideoBackend {
            reason: format!("Failed to decode Veo response: {e}"),
        })?;
        Ok(parsed.id)
    }

    async fn query_status(&self, remote_id: &str) -> Result<StatusSnapshot, LoomError> {
        let url = format!("{}/{}", self.api_url.trim_end_matches('/'), remote_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LoomError::VideoBackend {
                reason: format!("Failed to query generation status: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LoomError::VideoBackend {
                reason: format!("status query returned {status}: {body}"),
            });
        }

        let parsed: GenerateResponse = resp.json().await.map_err(|e| LoomError::VideoBackend {
            reason: format!("Failed to decode status response: {e}"),
        })?;
        Ok(StatusSnapshot {
            status: parsed.status,
            message: if parsed.message.is_empty() { None } else { Some(parsed.message) },
            asset_url: parsed
                .data
                .and_then(|d| d.videos.into_iter().next())
                .map(|v| v.url),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, LoomError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| LoomError::VideoBackend {
                reason: format!("Failed to download video: {e}"),
            })?;
        if !resp.status().is_success() {
            return Err(LoomError::VideoBackend {
                reason: format!("download failed with status {}", resp.status()),
            });
        }
        let bytes = resp.bytes().await.map_err(|e| LoomError::VideoBackend {
            reason: format!("Failed to read video body: {e}"),
        })?;
        Ok(bytes.to_vec())
    }

    /// 分鏡脚本から動画生成プロンプトを組み立てる
    fn build_video_prompt(storyboard: &Storyboard) -> String {
        let mut prompt = String::from("Create an anime-style video with the following scenes:\n\n");

        for (i, shot) in storyboard.shots.iter().enumerate() {
            prompt.push_str(&format!(
                "Scene {} ({} shot, {:.1} seconds):\n{}\n",
                i + 1,
                shot.shot_type,
                shot.duration,
                shot.description
            ));
            if let Some(dialogue) = &shot.dialogue {
                prompt.push_str(&format!(
                    "Dialogue: {} says \"{}\" ({} emotion)\n",
                    dialogue.character, dialogue.text, dialogue.emotion
                ));
            }
            if !shot.characters.is_empty() {
                prompt.push_str(&format!("Characters: {}\n", shot.characters.join(", ")));
            }
            prompt.push_str(&format!("Transition: {}\n\n", shot.transition));
        }

        prompt.push_str("\nStyle: Japanese anime/manga art style, high quality, cinematic");
        prompt
    }
}

#[async_trait]
impl DirectVideoGenerator for VeoRelay {
    async fn generate(
        &self,
        task_id: &str,
        storyboard: &Storyboard,
        cancel: &CancellationToken,
    ) -> Result<GeneratedClip, LoomError> {
        info!(
            "🛰️ VeoRelay: Starting direct video generation (task: {}, shots: {})",
            task_id,
            storyboard.shots.len()
        );

        let prompt = Self::build_video_prompt(storyboard);
        let remote_id = self.submit(&prompt).await?;
        info!("🛰️ VeoRelay: Generation submitted (task: {}, remote: {})", task_id, remote_id);

        let snapshot = await_terminal(
            || self.query_status(&remote_id),
            self.poll_interval,
            self.max_wait,
            cancel,
        )
        .await?;

        // await_terminal は asset_url 付きの成功しか返さない
        let url = snapshot.asset_url.ok_or_else(|| LoomError::VideoBackend {
            reason: "generation reported success but returned no retrievable asset".to_string(),
        })?;
        let data = self.download(&url).await?;

        let project_dir = self.vault.ensure_project(task_id).await?;
        let video_path = project_dir.join("output.mp4");
        tokio::fs::write(&video_path, &data)
            .await
            .map_err(|e| LoomError::Storage {
                reason: format!("Failed to save video {}: {}", video_path.display(), e),
            })?;

        info!(
            "🛰️ VeoRelay: Video saved (task: {}, path: {}, size: {} bytes)",
            task_id,
            video_path.display(),
            data.len()
        );
        Ok(GeneratedClip {
            video_path: video_path.to_string_lossy().to_string(),
            file_size: data.len() as u64,
        })
    }
}
