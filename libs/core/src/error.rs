//! # ドメインエラー型
//!
//! `thiserror` を使い、すべてのドメインエラーに明確な型を付与する。
//! `unwrap()` / `expect()` は非テストコードでは禁止。

use thiserror::Error;

/// CineLoom のドメインエラー
#[derive(Debug, Error)]
pub enum LoomError {
    // === 入力検証 ===
    #[error("入力が不正: {reason}")]
    InvalidInput { reason: String },

    // === タスクレジストリ ===
    #[error("タスクが見つからない: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("生産ラインが満杯 (キュー容量: {capacity})")]
    LineBusy { capacity: usize },

    // === ポリシーガード ===
    #[error("ショット数が上限を超過: {shots} 本生成 (上限 {limit} 本)")]
    ShotBudget { shots: usize, limit: usize },

    // === LLM ===
    #[error("LLM 応答エラー: {source}")]
    LlmResponse {
        #[source]
        source: anyhow::Error,
    },

    // === 画像生成 ===
    #[error("画像生成バックエンドエラー: {reason}")]
    ImageBackend { reason: String },

    // === 動画生成 (直行パス) ===
    #[error("動画生成バックエンドエラー: {reason}")]
    VideoBackend { reason: String },

    #[error("動画生成ポーリングがタイムアウト ({waited_secs}秒, {checks}回確認)")]
    PollTimeout { checks: u32, waited_secs: u64 },

    // === メディア合成 ===
    #[error("FFmpeg 実行エラー: {reason}")]
    FfmpegFailed { reason: String },

    // === アーティファクト保管 ===
    #[error("ストレージエラー: {reason}")]
    Storage { reason: String },

    // === キャンセル ===
    #[error("処理がキャンセルされた")]
    Cancelled,
}
