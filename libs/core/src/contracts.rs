//! # データ契約
//!
//! タスクレコード・ステージ・分鏡脚本など、パイプライン全体で流通する
//! 構造体を定義する。serde のフィールド名は HTTP API のワイヤ形式そのもの。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// タスク全体の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// ステージの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// パイプラインの4つの固定ステージ。順序に意味があり、生成後は変化しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    ParseScript,
    GenerateStoryboard,
    GenerateImages,
    RenderVideo,
}

impl StageName {
    /// 固定の実行順
    pub const ALL: [StageName; 4] = [
        StageName::ParseScript,
        StageName::GenerateStoryboard,
        StageName::GenerateImages,
        StageName::RenderVideo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::ParseScript => "parse_script",
            StageName::GenerateStoryboard => "generate_storyboard",
            StageName::GenerateImages => "generate_images",
            StageName::RenderVideo => "render_video",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1ステージ分の進行記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// 進行中の詳細 (例: "3/10 shots")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    /// 耗時(秒)。start_at と end_at が揃った時点で確定する。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
}

impl Stage {
    fn pending(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            progress: None,
            current: None,
            duration: None,
            start_at: None,
            end_at: None,
        }
    }
}

/// 生成オプション
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub style: String,
    pub duration_target: u32,
    pub aspect_ratio: String,
    pub bgm: String,
}

impl GenerationOptions {
    /// 未指定のオプションを既定値で埋める。レジストリに保存する前に必ず呼ぶ。
    pub fn apply_defaults(&mut self, default_bgm: &str) {
        if self.style.is_empty() {
            self.style = "anime".to_string();
        }
        if self.duration_target == 0 {
            self.duration_target = 60;
        }
        if self.aspect_ratio.is_empty() {
            self.aspect_ratio = "16:9".to_string();
        }
        if self.bgm.is_empty() {
            self.bgm = default_bgm.to_string();
        }
    }
}

/// 投稿された入力のスナップショット。タスク生成後は不変。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInput {
    pub text: String,
    #[serde(default)]
    pub options: GenerationOptions,
}

/// 生成結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
    pub video_path: String,
    pub duration: f64,
    /// 公称解像度。実測値ではなく設定由来の記述的メタデータ。
    pub resolution: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    pub shot_count: usize,
}

/// タスクレコード。レジストリ経由でのみ観測・更新される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "task_id")]
    pub id: String,
    pub status: TaskStatus,
    /// 0-100。queued 後は決して巻き戻らない。
    pub progress: u8,
    pub current_step: String,
    pub steps: Vec<Stage>,
    pub input: GenerationInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RenderResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// queued 状態・4ステージすべて pending の新規タスクを作る
    pub fn new(id: impl Into<String>, input: GenerationInput) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: TaskStatus::Queued,
            progress: 0,
            current_step: "queued".to_string(),
            steps: StageName::ALL.iter().map(|n| Stage::pending(*n)).collect(),
            input,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// ステージ遷移。processing で開始時刻、completed/failed で終了時刻と
    /// 耗時を記録し、current_step と updated_at を更新する。
    pub fn update_stage(&mut self, name: StageName, status: StageStatus) {
        let now = Utc::now();
        if let Some(stage) = self.steps.iter_mut().find(|s| s.name == name) {
            stage.status = status;
            match status {
                StageStatus::Processing => stage.start_at = Some(now),
                StageStatus::Completed | StageStatus::Failed => {
                    stage.end_at = Some(now);
                    if let Some(start) = stage.start_at {
                        stage.duration = Some((now - start).num_milliseconds() as f64 / 1000.0);
                    }
                }
                StageStatus::Pending => {}
            }
        }
        self.current_step = name.as_str().to_string();
        self.updated_at = now;
    }

    /// ステージ内サブ進捗の反映
    pub fn set_stage_progress(&mut self, name: StageName, progress: u8, current: impl Into<String>) {
        if let Some(stage) = self.steps.iter_mut().find(|s| s.name == name) {
            stage.progress = Some(progress);
            stage.current = Some(current.into());
        }
        self.updated_at = Utc::now();
    }

    /// 結果を添付して completed に遷移する
    pub fn complete(&mut self, result: RenderResult) {
        self.result = Some(result);
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.updated_at = Utc::now();
    }

    /// エラーを記録して failed に遷移する
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(message.into());
        self.updated_at = Utc::now();
    }
}

// --- 剧本・分鏡の契約 ---

/// 解析済み剧本
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedScript {
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// 場面
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: u32,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub dialogues: Vec<Dialogue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// 台詞
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialogue {
    pub character: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub emotion: String,
}

/// 動作描写
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub character: String,
    pub description: String,
}

/// 解析メタデータ
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub total_scenes: usize,
    pub total_shots: usize,
    pub estimated_duration: f64,
    pub word_count: usize,
}

/// 分鏡脚本
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Storyboard {
    pub shots: Vec<Shot>,
    #[serde(default)]
    pub total_duration: f64,
}

/// ショット種別
pub mod shot_type {
    pub const CLOSEUP: &str = "closeup";
    pub const MEDIUM: &str = "medium";
    pub const LONG: &str = "long";
}

/// トランジション種別
pub mod transition {
    pub const CUT: &str = "cut";
    pub const FADE: &str = "fade";
    pub const DISSOLVE: &str = "dissolve";
}

/// 1ショット分の分鏡
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub id: u32,
    /// closeup / medium / long
    #[serde(rename = "type", default)]
    pub shot_type: String,
    pub description: String,
    #[serde(default)]
    pub characters: Vec<String>,
    pub duration: f64,
    /// cut / fade / dissolve
    #[serde(default)]
    pub transition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<Dialogue>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
}

/// 直行パスが返す生成済みクリップ
#[derive(Debug, Clone)]
pub struct GeneratedClip {
    pub video_path: String,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> GenerationInput {
        GenerationInput {
            text: "昔々あるところに。".to_string(),
            options: GenerationOptions::default(),
        }
    }

    #[test]
    fn test_new_task_shape() {
        let task = Task::new("t-1", sample_input());
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.steps.len(), 4);
        assert_eq!(task.steps[0].name, StageName::ParseScript);
        assert_eq!(task.steps[1].name, StageName::GenerateStoryboard);
        assert_eq!(task.steps[2].name, StageName::GenerateImages);
        assert_eq!(task.steps[3].name, StageName::RenderVideo);
        assert!(task.steps.iter().all(|s| s.status == StageStatus::Pending));
        assert_eq!(task.current_step, "queued");
    }

    #[test]
    fn test_update_stage_records_timing() {
        let mut task = Task::new("t-2", sample_input());
        task.update_stage(StageName::ParseScript, StageStatus::Processing);
        assert_eq!(task.current_step, "parse_script");
        assert!(task.steps[0].start_at.is_some());
        assert!(task.steps[0].end_at.is_none());

        task.update_stage(StageName::ParseScript, StageStatus::Completed);
        let stage = &task.steps[0];
        assert_eq!(stage.status, StageStatus::Completed);
        assert!(stage.end_at.is_some());
        assert!(stage.duration.is_some());
        assert!(stage.duration.unwrap() >= 0.0);
    }

    #[test]
    fn test_failed_stage_without_start_has_no_duration() {
        let mut task = Task::new("t-3", sample_input());
        // processing を経ずに failed へ落とした場合は耗時を記録しない
        task.update_stage(StageName::GenerateStoryboard, StageStatus::Failed);
        let stage = &task.steps[1];
        assert!(stage.duration.is_none());
        assert!(stage.end_at.is_some());
    }

    #[test]
    fn test_set_stage_progress() {
        let mut task = Task::new("t-4", sample_input());
        task.set_stage_progress(StageName::GenerateImages, 30, "3/10 shots");
        let stage = &task.steps[2];
        assert_eq!(stage.progress, Some(30));
        assert_eq!(stage.current.as_deref(), Some("3/10 shots"));
    }

    #[test]
    fn test_complete_sets_result_and_progress() {
        let mut task = Task::new("t-5", sample_input());
        task.complete(RenderResult {
            video_path: "/tmp/out.mp4".to_string(),
            duration: 42.0,
            resolution: "1920x1080".to_string(),
            file_size: 1024,
            thumbnail_path: None,
            shot_count: 7,
        });
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.result.is_some());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_options_defaults() {
        let mut opts = GenerationOptions::default();
        opts.apply_defaults("calm.mp3");
        assert_eq!(opts.style, "anime");
        assert_eq!(opts.duration_target, 60);
        assert_eq!(opts.aspect_ratio, "16:9");
        assert_eq!(opts.bgm, "calm.mp3");

        // 指定済みの値は上書きしない
        let mut opts = GenerationOptions {
            style: "realistic".to_string(),
            duration_target: 30,
            aspect_ratio: "9:16".to_string(),
            bgm: "epic.mp3".to_string(),
        };
        opts.apply_defaults("calm.mp3");
        assert_eq!(opts.style, "realistic");
        assert_eq!(opts.duration_target, 30);
        assert_eq!(opts.bgm, "epic.mp3");
    }

    #[test]
    fn test_task_serializes_wire_field_names() {
        let task = Task::new("t-6", sample_input());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task_id"], "t-6");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["steps"][0]["name"], "parse_script");
        assert_eq!(json["steps"][0]["status"], "pending");
        // 未設定の Option フィールドはワイヤに現れない
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }
}
