//! # HTTP API
//!
//! すべての JSON 応答は `{code, message, data, error, timestamp}` の
//! 封筒形式。ダウンロードだけは生の MP4 バイト列を返す。

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use infrastructure::project_vault::ProjectVault;
use infrastructure::task_registry::TaskRegistry;
use loom_core::contracts::{GenerationInput, GenerationOptions, Task, TaskStatus};
use loom_core::error::LoomError;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conveyor::Conveyor;

pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub conveyor: Conveyor,
    pub vault: Arc<ProjectVault>,
    pub generation_mode: String,
    pub max_text_length: usize,
    pub default_bgm: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/generate", post(generate_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/tasks/:task_id", get(task_detail_handler))
        .route("/api/tasks/:task_id", delete(delete_task_handler))
        .route("/api/download/:task_id", get(download_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- 封筒 ---

fn envelope(code: StatusCode, message: &str, data: Option<serde_json::Value>, error: Option<String>) -> Response {
    (
        code,
        Json(serde_json::json!({
            "code": code.as_u16(),
            "message": message,
            "data": data,
            "error": error,
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

fn ok(data: serde_json::Value) -> Response {
    envelope(StatusCode::OK, "success", Some(data), None)
}

fn reject(code: StatusCode, error: impl Into<String>) -> Response {
    envelope(code, "error", None, Some(error.into()))
}

// --- ハンドラ ---

#[derive(Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: GenerationOptions,
}

/// POST /api/generate
///
/// 入力検証 → タスク登録 → キュー投入。キューが満杯なら登録を
/// 巻き戻して 429 を返す（幽霊タスクを残さない）。
async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Response {
    if req.text.trim().is_empty() {
        return reject(StatusCode::BAD_REQUEST, "text is required");
    }
    let length = req.text.chars().count();
    if length > state.max_text_length {
        return reject(
            StatusCode::BAD_REQUEST,
            format!("text too long: {} chars (limit {})", length, state.max_text_length),
        );
    }

    let mut options = req.options;
    options.apply_defaults(&state.default_bgm);

    let task_id = Uuid::new_v4().to_string();
    let task = Task::new(
        &task_id,
        GenerationInput {
            text: req.text,
            options,
        },
    );
    state.registry.create(task).await;

    if let Err(e) = state.conveyor.submit(task_id.clone()) {
        // 受理できないタスクはレジストリからも取り除く
        if let Err(e) = state.registry.delete(&task_id).await {
            warn!("📡 API: Rollback of rejected task failed: {}", e);
        }
        return reject(StatusCode::TOO_MANY_REQUESTS, e.to_string());
    }

    info!("📡 API: Task accepted: {}", task_id);
    ok(serde_json::json!({
        "task_id": task_id,
        "status": "queued",
        "estimated_time": 300,
    }))
}

/// GET /api/tasks/:task_id
async fn task_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.registry.get(&task_id).await {
        Some(task) => match serde_json::to_value(&task) {
            Ok(value) => ok(value),
            Err(e) => reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        None => reject(StatusCode::NOT_FOUND, format!("task not found: {task_id}")),
    }
}

/// GET /api/tasks
async fn list_tasks_handler(State(state): State<Arc<AppState>>) -> Response {
    let tasks = state.registry.list().await;
    let total = tasks.len();
    match serde_json::to_value(&tasks) {
        Ok(value) => ok(serde_json::json!({ "tasks": value, "total": total })),
        Err(e) => reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /api/download/:task_id
///
/// 完成済みタスクの成果物を MP4 として返す。
async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    let Some(task) = state.registry.get(&task_id).await else {
        return reject(StatusCode::NOT_FOUND, format!("task not found: {task_id}"));
    };
    if task.status != TaskStatus::Completed {
        return reject(StatusCode::BAD_REQUEST, "task is not completed yet");
    }
    let Some(result) = &task.result else {
        return reject(StatusCode::BAD_REQUEST, "task has no render result");
    };

    match tokio::fs::read(&result.video_path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "video/mp4".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{task_id}.mp4\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!("📡 API: Video file missing for {}: {}", task_id, e);
            reject(StatusCode::NOT_FOUND, "video file not found on disk")
        }
    }
}

/// DELETE /api/tasks/:task_id
///
/// レコードとディスク上のアーティファクトを削除する。実行待ちのタスクは
/// 消しても安全（ワーカー側が不在を検知してスキップする）。
async fn delete_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    if let Err(e) = state.vault.remove_project(&task_id).await {
        warn!("📡 API: Artifact cleanup failed for {}: {}", task_id, e);
    }
    match state.registry.delete(&task_id).await {
        Ok(()) => {
            info!("📡 API: Task deleted: {}", task_id);
            ok(serde_json::json!({ "task_id": task_id }))
        }
        Err(LoomError::TaskNotFound { .. }) => {
            reject(StatusCode::NOT_FOUND, format!("task not found: {task_id}"))
        }
        Err(e) => reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    ok(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.generation_mode,
        "time": Utc::now(),
    }))
}
