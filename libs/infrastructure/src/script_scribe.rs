//! # ScriptScribe — LLM 剧本解析・分鏡設計クライアント
//!
//! OpenAI 互換の chat completions API を叩き、小説テキストの構造化
//! (ScriptParser) とショット単位の分鏡設計 (StoryboardPlanner) を行う。
//! 応答は strict JSON を要求するが、モデルがコードフェンスで包んで
//! 返すケースに備えてフォールバックの剥がし処理を持つ。

use crate::project_vault::ProjectVault;
use anyhow::anyhow;
use async_trait::async_trait;
use loom_core::contracts::{shot_type, ParsedScript, Shot, Storyboard};
use loom_core::error::LoomError;
use loom_core::traits::{ScriptParser, StoryboardPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 全ショット共通のネガティブプロンプト
pub const NEGATIVE_PROMPT: &str = "low quality, blurry, distorted, ugly, bad anatomy, \
    bad proportions, bad hands, text, error, missing fingers, extra digit, fewer digits, \
    cropped, worst quality, jpeg artifacts, signature, watermark, username";

#[derive(Clone)]
pub struct ScriptScribe {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    vault: Arc<ProjectVault>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl ScriptScribe {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
        vault: Arc<ProjectVault>,
    ) -> Result<Self, LoomError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LoomError::LlmResponse { source: e.into() })?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            vault,
        })
    }

    /// chat completions を1回呼び、応答本文の JSON 文字列を返す
    async fn complete(&self, system: &str, user: &str) -> Result<String, LoomError> {
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            response_format: ResponseFormat { format_type: "json_object" },
            // 出力を安定させるため温度は低め
            temperature: 0.3,
        };

        let url = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| LoomError::LlmResponse { source: e.into() })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LoomError::LlmResponse {
                source: anyhow!("LLM API returned status {status}: {body}"),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LoomError::LlmResponse { source: e.into() })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LoomError::LlmResponse {
                source: anyhow!("no choices in LLM response"),
            })?;
        Ok(choice.message.content)
    }
}

#[async_trait]
impl ScriptParser for ScriptScribe {
    async fn parse(&self, task_id: &str, text: &str) -> Result<ParsedScript, LoomError> {
        info!("📜 ScriptScribe: Parsing script (task: {}, {} chars)", task_id, text.chars().count());

        let content = self.complete(PARSE_SYSTEM, &parse_prompt(text)).await?;
        debug!("ScriptScribe response: {}", content);

        let mut parsed: ParsedScript = serde_json::from_str(strip_json_fences(&content))
            .map_err(|e| LoomError::LlmResponse {
                source: anyhow!("failed to parse LLM response as script JSON: {e}"),
            })?;

        // モデルが埋め忘れたメタデータを補完する
        if parsed.metadata.word_count == 0 {
            parsed.metadata.word_count = text.chars().count();
        }
        if parsed.metadata.total_scenes == 0 {
            parsed.metadata.total_scenes = parsed.scenes.len();
        }

        let project_dir = self.vault.ensure_project(task_id).await?;
        if let Err(e) = self
            .vault
            .save_json(&project_dir.join("script.txt"), &serde_json::json!({ "text": text }))
            .await
        {
            warn!("📜 ScriptScribe: Failed to save original script: {}", e);
        }
        self.vault
            .save_json(&project_dir.join("parsed.json"), &parsed)
            .await?;

        info!(
            "📜 ScriptScribe: Script parsed (task: {}, scenes: {}, characters: {})",
            task_id,
            parsed.scenes.len(),
            parsed.characters.len()
        );
        Ok(parsed)
    }
}

#[async_trait]
impl StoryboardPlanner for ScriptScribe {
    async fn plan(
        &self,
        task_id: &str,
        parsed: &ParsedScript,
        target_duration_secs: u32,
    ) -> Result<Storyboard, LoomError> {
        info!(
            "🎞️ ScriptScribe: Planning storyboard (task: {}, scenes: {}, target: {}s)",
            task_id,
            parsed.scenes.len(),
            target_duration_secs
        );

        let parsed_json = serde_json::to_string(parsed).map_err(|e| LoomError::LlmResponse {
            source: anyhow!("failed to serialize parsed script: {e}"),
        })?;
        let content = self
            .complete(PLAN_SYSTEM, &plan_prompt(&parsed_json, target_duration_secs))
            .await?;

        let mut storyboard: Storyboard = serde_json::from_str(strip_json_fences(&content))
            .map_err(|e| LoomError::LlmResponse {
                source: anyhow!("failed to parse LLM response as storyboard JSON: {e}"),
            })?;

        if storyboard.total_duration == 0.0 {
            storyboard.total_duration = storyboard.shots.iter().map(|s| s.duration).sum();
        }
        for shot in &mut storyboard.shots {
            if shot.prompt.is_empty() {
                shot.prompt = image_prompt(shot);
            }
        }

        let project_dir = self.vault.ensure_project(task_id).await?;
        self.vault
            .save_json(&project_dir.join("storyboard.json"), &storyboard)
            .await?;

        info!(
            "🎞️ ScriptScribe: Storyboard ready (task: {}, shots: {}, duration: {:.1}s)",
            task_id,
            storyboard.shots.len(),
            storyboard.total_duration
        );
        Ok(storyboard)
    }
}

const PARSE_SYSTEM: &str = "You are a professional script analyst. Always answer with a \
    single JSON object and no markdown code fences.";

fn parse_prompt(text: &str) -> String {
    format!(
        r#"Analyze the following narrative text and extract structured scene data.

Text:
{text}

Requirements:
1. Identify every scene with its location and time of day.
2. List every character that appears.
3. Capture dialogues (with speaker and emotion) and actions per scene.

Return strictly this JSON shape:
{{
  "scenes": [
    {{
      "id": 1,
      "location": "where the scene happens",
      "time": "time of day",
      "characters": ["name"],
      "dialogues": [{{"character": "name", "text": "line", "emotion": "mood"}}],
      "actions": [{{"character": "name", "description": "what happens"}}]
    }}
  ],
  "characters": ["name"],
  "metadata": {{"total_scenes": 1, "word_count": 100}}
}}"#
    )
}

const PLAN_SYSTEM: &str = "You are a professional storyboard director. Always answer with a \
    single JSON object and no markdown code fences.";

fn plan_prompt(parsed_json: &str, target_duration_secs: u32) -> String {
    format!(
        r#"Design a shot-by-shot storyboard from this parsed script.

Parsed script:
{parsed_json}

Target video duration: {target_duration_secs} seconds.

Rules:
- Each shot has a type (closeup, medium or long), a visual description,
  a duration in seconds and a transition (cut, fade or dissolve).
- Attach the relevant dialogue to the shot it belongs to.
- Shot durations should sum close to the target duration.

Return strictly this JSON shape:
{{
  "shots": [
    {{
      "id": 1,
      "type": "medium",
      "description": "what the camera sees",
      "characters": ["name"],
      "duration": 4.0,
      "transition": "cut",
      "dialogue": {{"character": "name", "text": "line", "emotion": "mood"}}
    }}
  ],
  "total_duration": {target_duration_secs}
}}"#
    )
}

/// ショットから AI 作画プロンプトを合成する
pub fn image_prompt(shot: &Shot) -> String {
    let mut prompt = String::from("anime style, manga, japanese animation, high quality, detailed, cinematic, ");

    match shot.shot_type.as_str() {
        shot_type::CLOSEUP => prompt.push_str("close-up shot, facial expression, detailed face, "),
        shot_type::MEDIUM => prompt.push_str("medium shot, half body, character interaction, "),
        shot_type::LONG => prompt.push_str("wide shot, establishing shot, full body, environment, "),
        _ => prompt.push_str("medium shot, "),
    }

    prompt.push_str(&shot.description);

    if !shot.characters.is_empty() {
        prompt.push_str(&format!(", featuring {} character(s)", shot.characters.len()));
    }
    if let Some(dialogue) = &shot.dialogue {
        if !dialogue.emotion.is_empty() {
            prompt.push_str(&format!(", {} atmosphere", dialogue.emotion));
        }
    }

    prompt.push_str(", professional artwork, trending on pixiv");
    prompt
}

/// モデルが ```json ... ``` で包んで返した場合にフェンスを剥がす
fn strip_json_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::contracts::Dialogue;

    #[test]
    fn test_strip_json_fences() {
        assert_eq!(strip_json_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_json_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    fn shot(shot_type: &str) -> Shot {
        Shot {
            id: 1,
            shot_type: shot_type.to_string(),
            description: "a quiet street at dusk".to_string(),
            characters: vec!["Aoi".to_string()],
            duration: 4.0,
            transition: "cut".to_string(),
            dialogue: Some(Dialogue {
                character: "Aoi".to_string(),
                text: "It is late.".to_string(),
                emotion: "melancholic".to_string(),
            }),
            image_path: String::new(),
            prompt: String::new(),
        }
    }

    #[test]
    fn test_image_prompt_shot_types() {
        let p = image_prompt(&shot(shot_type::CLOSEUP));
        assert!(p.contains("close-up shot"));

        let p = image_prompt(&shot(shot_type::LONG));
        assert!(p.contains("establishing shot"));

        // 未知のショット種別は medium 扱い
        let p = image_prompt(&shot("unknown"));
        assert!(p.contains("medium shot"));
    }

    #[test]
    fn test_image_prompt_includes_context() {
        let p = image_prompt(&shot(shot_type::MEDIUM));
        assert!(p.contains("a quiet street at dusk"));
        assert!(p.contains("featuring 1 character(s)"));
        assert!(p.contains("melancholic atmosphere"));
        assert!(p.ends_with("trending on pixiv"));
    }

    #[test]
    fn test_storyboard_json_roundtrip() {
        // LLM が返す想定の最小 JSON が契約どおり読めること
        let raw = r#"{"shots":[{"id":1,"type":"medium","description":"d","duration":3.5,"transition":"cut"}]}"#;
        let sb: Storyboard = serde_json::from_str(strip_json_fences(raw)).unwrap();
        assert_eq!(sb.shots.len(), 1);
        assert_eq!(sb.shots[0].shot_type, "medium");
        assert_eq!(sb.total_duration, 0.0);
    }
}
