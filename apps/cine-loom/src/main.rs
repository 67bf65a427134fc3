//! # CineLoom — 小説テキストから短編動画を生成するサーバー
//!
//! 起動時に生成モード (local_sd / veo) を確定し、4ステージの生産ライン
//! と固定ワーカープールを立ち上げて HTTP API を公開する。

use clap::Parser;
use infrastructure::image_atelier::ImageAtelier;
use infrastructure::media_forge::MediaForge;
use infrastructure::project_vault::ProjectVault;
use infrastructure::script_scribe::ScriptScribe;
use infrastructure::task_registry::TaskRegistry;
use infrastructure::veo_relay::VeoRelay;
use shared::config::LoomConfig;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod conveyor;
mod pipeline;
mod server;

use conveyor::Conveyor;
use pipeline::{GenerationPath, PipelineRunner};
use server::router::{create_router, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 待ち受けアドレスの上書き (例: 0.0.0.0:9090)
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // 1. 設定を読み込む
    let config = LoomConfig::load()?;
    info!("⚙️  Config loaded:");
    info!("   Mode:       {}", config.generation_mode);
    info!("   LLM:        {} ({})", config.llm_api_url, config.llm_model);
    info!("   Data dir:   {}", config.data_dir);
    info!("   Workers:    {} (queue: {})", config.worker_count, config.queue_capacity);

    // 2. アーティファクト保管庫の準備
    let vault = Arc::new(ProjectVault::new(&config.data_dir));
    std::fs::create_dir_all(std::path::Path::new(&config.data_dir).join("projects"))?;
    std::fs::create_dir_all(std::path::Path::new(&config.data_dir).join("assets").join("bgm"))?;

    // 3. LLM クライアント (剧本解析・分鏡設計の両方を担う)
    let scribe = Arc::new(ScriptScribe::new(
        &config.llm_api_url,
        &config.llm_api_key,
        &config.llm_model,
        config.llm_timeout_secs,
        vault.clone(),
    )?);

    // 4. 生成経路の確定。モードと依存ツールの検査は起動時に済ませる。
    let path = if config.generation_mode == "veo" {
        if let Err(e) = MediaForge::check_installed().await {
            warn!("🎬 ffmpeg not available (not required for veo mode): {}", e);
        }
        let relay = VeoRelay::new(
            &config.veo_api_url,
            &config.veo_api_key,
            &config.veo_model,
            config.veo_timeout_secs,
            config.veo_max_wait_secs,
            config.veo_poll_interval_secs,
            config.veo_clip_secs,
            vault.clone(),
        )?;
        if let Err(e) = relay.health_check().await {
            warn!("🛰️ Veo API health check failed (continuing): {}", e);
        }
        GenerationPath::DirectVideo {
            generator: Arc::new(relay),
        }
    } else {
        // local_sd はレンダリングに ffmpeg が必須
        MediaForge::check_installed().await?;
        let (width, height) = config.resolution_dims();
        let atelier = ImageAtelier::new(
            &config.sd_api_url,
            config.sd_timeout_secs,
            width,
            height,
            vault.clone(),
        )?;
        if let Err(e) = atelier.health_check().await {
            warn!("🎨 SD API health check failed (continuing): {}", e);
        }
        GenerationPath::ImageRender {
            illustrator: Arc::new(atelier),
            assembler: Arc::new(MediaForge::new(config.fps, &config.resolution, vault.clone())),
        }
    };

    // 5. 生産ラインの組み立て
    let registry = Arc::new(TaskRegistry::new());
    let runner = Arc::new(PipelineRunner::new(
        registry.clone(),
        scribe.clone(),
        scribe,
        path,
        config.max_shots_per_video,
        &config.resolution,
    ));

    let shutdown = CancellationToken::new();
    let conveyor = Conveyor::start(
        runner,
        config.worker_count,
        config.queue_capacity,
        shutdown.clone(),
    );

    // 6. HTTP サーバー
    let state = Arc::new(AppState {
        registry,
        conveyor,
        vault,
        generation_mode: config.generation_mode.clone(),
        max_text_length: config.max_text_length,
        default_bgm: config.default_bgm.clone(),
    });
    let app = create_router(state);

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    info!("📡 CineLoom listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            info!("🛑 SIGINT received. Shutting down gracefully...");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
