use serde::{Deserialize, Serialize};

/// CineLoom 全体の設定
#[derive(Clone, Serialize, Deserialize)]
pub struct LoomConfig {
    /// HTTP サーバーの待ち受けアドレス
    pub bind_addr: String,
    /// アーティファクト保管ディレクトリ (projects/, assets/bgm/)
    pub data_dir: String,

    /// OpenAI 互換 API エンドポイント
    pub llm_api_url: String,
    /// LLM API キー
    pub llm_api_key: String,
    /// 剧本解析・分鏡生成に使うモデル名
    pub llm_model: String,
    /// LLM 呼び出しタイムアウト（秒）
    pub llm_timeout_secs: u64,

    /// 生成モード: "veo" (直行動画生成) | "local_sd" (画像生成+レンダリング)
    pub generation_mode: String,

    /// Veo 互換 文生視頻 API エンドポイント
    pub veo_api_url: String,
    /// Veo API キー
    pub veo_api_key: String,
    /// Veo モデル名
    pub veo_model: String,
    /// Veo HTTP タイムアウト（秒）
    pub veo_timeout_secs: u64,
    /// 完了待ちポーリングの上限（秒）
    pub veo_max_wait_secs: u64,
    /// ポーリング間隔（秒）。クライアント側で 3秒を下限として切り上げる。
    pub veo_poll_interval_secs: u64,
    /// プロバイダが受け付けるクリップ尺（秒）。現状 8秒固定の制約をそのまま持つ。
    pub veo_clip_secs: u32,

    /// Stable Diffusion WebUI API エンドポイント
    pub sd_api_url: String,
    /// SD HTTP タイムアウト（秒）
    pub sd_timeout_secs: u64,

    /// 公称解像度 (例: "1920x1080")。成果物メタデータにそのまま載る。
    pub resolution: String,
    /// レンダリング FPS
    pub fps: u32,
    /// 既定の BGM ファイル名 (assets/bgm/ 配下)
    pub default_bgm: String,

    /// 投稿テキストの最大長（文字数）
    pub max_text_length: usize,
    /// 1本あたりのショット数上限
    pub max_shots_per_video: usize,

    /// パイプラインワーカー数
    pub worker_count: usize,
    /// 投稿キューの容量。満杯時は即時 LineBusy を返す。
    pub queue_capacity: usize,
}

impl std::fmt::Debug for LoomConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoomConfig")
            .field("bind_addr", &self.bind_addr)
            .field("data_dir", &self.data_dir)
            .field("llm_api_url", &self.llm_api_url)
            .field("llm_api_key", if self.llm_api_key.is_empty() { &"" } else { &"***" })
            .field("llm_model", &self.llm_model)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("generation_mode", &self.generation_mode)
            .field("veo_api_url", &self.veo_api_url)
            .field("veo_api_key", if self.veo_api_key.is_empty() { &"" } else { &"***" })
            .field("veo_model", &self.veo_model)
            .field("veo_max_wait_secs", &self.veo_max_wait_secs)
            .field("veo_poll_interval_secs", &self.veo_poll_interval_secs)
            .field("veo_clip_secs", &self.veo_clip_secs)
            .field("sd_api_url", &self.sd_api_url)
            .field("resolution", &self.resolution)
            .field("fps", &self.fps)
            .field("default_bgm", &self.default_bgm)
            .field("max_text_length", &self.max_text_length)
            .field("max_shots_per_video", &self.max_shots_per_video)
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl LoomConfig {
    /// 設定をファイルまたは環境変数から読み込む
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("bind_addr", "0.0.0.0:8080")?
            .set_default("data_dir", "./data")?
            .set_default("llm_api_url", "https://api.openai.com/v1")?
            .set_default("llm_api_key", std::env::var("OPENAI_API_KEY").unwrap_or_default())?
            .set_default("llm_model", "gpt-4o-mini")?
            .set_default("llm_timeout_secs", 120)?
            .set_default("generation_mode", "local_sd")?
            .set_default("veo_api_url", "https://api.qnaigc.com/v1/video/generations")?
            .set_default("veo_api_key", std::env::var("VEO_API_KEY").unwrap_or_default())?
            .set_default("veo_model", "veo-3.0-fast")?
            .set_default("veo_timeout_secs", 60)?
            .set_default("veo_max_wait_secs", 600)?
            .set_default("veo_poll_interval_secs", 10)?
            .set_default("veo_clip_secs", 8)?
            .set_default("sd_api_url", "http://127.0.0.1:7860")?
            .set_default("sd_timeout_secs", 300)?
            .set_default("resolution", "1920x1080")?
            .set_default("fps", 30)?
            .set_default("default_bgm", "gentle.mp3")?
            .set_default("max_text_length", 5000)?
            .set_default("max_shots_per_video", 30)?
            .set_default("worker_count", 2)?
            .set_default("queue_capacity", 16)?
            // config.toml があれば読み込む
            .add_source(config::File::with_name("config").required(false))
            // 環境変数 (CINE_LOOM_*) があれば上書き
            .add_source(config::Environment::with_prefix("CINE_LOOM"))
            .build()?;

        settings.try_deserialize()
    }

    /// 公称解像度を (幅, 高さ) に分解する。解釈できない場合は 1920x1080。
    pub fn resolution_dims(&self) -> (u32, u32) {
        let mut parts = self.resolution.split('x');
        match (
            parts.next().and_then(|w| w.parse().ok()),
            parts.next().and_then(|h| h.parse().ok()),
        ) {
            (Some(w), Some(h)) => (w, h),
            _ => (1920, 1080),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_load_defaults() {
        let config = LoomConfig::load().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.generation_mode, "local_sd");
        assert_eq!(config.veo_clip_secs, 8);
        assert_eq!(config.max_text_length, 5000);
    }

    #[test]
    fn test_config_load_from_file() {
        // 一時的な config.toml を作成 (toml 拡張子を付加してフォーマットを認識させる)
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "bind_addr = \"127.0.0.1:9999\"").unwrap();
        writeln!(file, "data_dir = \"/tmp/loom\"").unwrap();
        writeln!(file, "llm_api_url = \"http://custom:11434/v1\"").unwrap();
        writeln!(file, "llm_api_key = \"k\"").unwrap();
        writeln!(file, "llm_model = \"custom-model\"").unwrap();
        writeln!(file, "llm_timeout_secs = 60").unwrap();
        writeln!(file, "generation_mode = \"veo\"").unwrap();
        writeln!(file, "veo_api_url = \"http://veo.local\"").unwrap();
        writeln!(file, "veo_api_key = \"k\"").unwrap();
        writeln!(file, "veo_model = \"veo-test\"").unwrap();
        writeln!(file, "veo_timeout_secs = 30").unwrap();
        writeln!(file, "veo_max_wait_secs = 120").unwrap();
        writeln!(file, "veo_poll_interval_secs = 10").unwrap();
        writeln!(file, "veo_clip_secs = 8").unwrap();
        writeln!(file, "sd_api_url = \"http://sd.local\"").unwrap();
        writeln!(file, "sd_timeout_secs = 120").unwrap();
        writeln!(file, "resolution = \"1280x720\"").unwrap();
        writeln!(file, "fps = 24").unwrap();
        writeln!(file, "default_bgm = \"calm.mp3\"").unwrap();
        writeln!(file, "max_text_length = 1000").unwrap();
        writeln!(file, "max_shots_per_video = 10").unwrap();
        writeln!(file, "worker_count = 1").unwrap();
        writeln!(file, "queue_capacity = 4").unwrap();

        let settings = config::Config::builder()
            .add_source(config::File::from(file.path()))
            .build()
            .unwrap();

        let config: LoomConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9999");
        assert_eq!(config.generation_mode, "veo");
        assert_eq!(config.resolution_dims(), (1280, 720));
    }

    #[test]
    fn test_resolution_dims_fallback() {
        let mut config = LoomConfig::load().unwrap();
        config.resolution = "garbage".to_string();
        assert_eq!(config.resolution_dims(), (1920, 1080));
    }

    #[test]
    fn test_debug_masks_api_keys() {
        let mut config = LoomConfig::load().unwrap();
        config.llm_api_key = "sk-secret".to_string();
        let dump = format!("{:?}", config);
        assert!(!dump.contains("sk-secret"));
        assert!(dump.contains("***"));
    }
}
