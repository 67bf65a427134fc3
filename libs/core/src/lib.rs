//! # Core — ドメインロジック層
//!
//! CineLoom のタスク・分鏡・ステージのデータモデルと、
//! パイプラインが消費する外部コラボレーターのインターフェースを定義する。
//! 具体的なI/O実装は `infrastructure` クレートに委譲する（依存性逆転の原則）。

pub mod contracts;
pub mod error;
pub mod traits;
