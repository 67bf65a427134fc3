//! # ステージ・インターフェース定義
//!
//! パイプラインが消費する外部コラボレーター（LLM、画像生成、動画生成、
//! メディア合成）の能力をトレイトとして定義する。
//! 具体実装は `libs/infrastructure` に配置する（依存性逆転の原則）。

use crate::contracts::{GeneratedClip, ParsedScript, RenderResult, Storyboard};
use crate::error::LoomError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// ショット生成の進捗フック。`(current, total)` を受け取り、呼び出し側の
/// 永続化が完了するまで await される。次のショットはその後にしか始まらない。
pub type ProgressHook = Box<dyn Fn(usize, usize) -> BoxFuture<'static, ()> + Send + Sync>;

/// 剧本解析ツール (ScriptScribe)
///
/// 小説テキストを LLM で解析し、場面・登場人物・台詞を構造化する。
#[async_trait]
pub trait ScriptParser: Send + Sync {
    async fn parse(&self, task_id: &str, text: &str) -> Result<ParsedScript, LoomError>;
}

/// 分鏡設計ツール (ScriptScribe)
///
/// 解析済み剧本から、目標尺長に合わせたショット単位の分鏡脚本を生成する。
#[async_trait]
pub trait StoryboardPlanner: Send + Sync {
    async fn plan(
        &self,
        task_id: &str,
        parsed: &ParsedScript,
        target_duration_secs: u32,
    ) -> Result<Storyboard, LoomError>;
}

/// ショット作画ツール (ImageAtelier)
///
/// 分鏡の各ショットに画像を生成し、`image_path` を埋めて返す。
/// ショット完了ごとに `on_progress` を await する。
#[async_trait]
pub trait ShotIllustrator: Send + Sync {
    async fn illustrate_all(
        &self,
        task_id: &str,
        storyboard: &mut Storyboard,
        on_progress: ProgressHook,
    ) -> Result<(), LoomError>;
}

/// 最終合成ツール (MediaForge)
///
/// 生成済み画像と BGM を FFmpeg で合成し、完成品の情報を返す。
#[async_trait]
pub trait VideoAssembler: Send + Sync {
    async fn assemble(
        &self,
        task_id: &str,
        storyboard: &Storyboard,
        bgm: Option<&str>,
    ) -> Result<RenderResult, LoomError>;
}

/// 直行動画生成ツール (VeoRelay)
///
/// 分鏡全体を1回の外部呼び出しで動画化する。内部で submit → 完了待ち
/// ポーリング → 取得までを行い、ポーリングの合間に `cancel` を監視する。
#[async_trait]
pub trait DirectVideoGenerator: Send + Sync {
    async fn generate(
        &self,
        task_id: &str,
        storyboard: &Storyboard,
        cancel: &CancellationToken,
    ) -> Result<GeneratedClip, LoomError>;
}
