//! # Shared — 設定層
//!
//! CineLoom 全体の設定を一箇所で定義する。
//! グローバル状態は持たず、読み込んだ設定は各コンポーネントの
//! コンストラクタへ明示的に渡す。

pub mod config;
