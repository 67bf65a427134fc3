//! # Infrastructure — I/O実装層
//!
//! `core` で定義されたトレイトの具体実装を提供する。
//! LLM、Stable Diffusion、文生視頻 API、FFmpeg 等の外部サービスとの
//! 通信と、タスクレジストリ・アーティファクト保管を担当。

pub mod image_atelier;
pub mod media_forge;
pub mod project_vault;
pub mod script_scribe;
pub mod task_registry;
pub mod veo_relay;
