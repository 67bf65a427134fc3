//! # PipelineRunner — 4ステージ生産ライン
//!
//! 1タスクを parse_script → generate_storyboard → generate_images →
//! render_video の固定順で流す。ステージ遷移はすべてレジストリ経由で
//! 永続化され、API からは常に最新の進行状況が観測できる。
//!
//! 生成モードが "veo" の場合は直行パスを取り、作画とレンダリングを
//! 1回の外部動画生成呼び出しに畳み込む（ステージ 3, 4 は即時完了扱い）。

use infrastructure::task_registry::TaskRegistry;
use loom_core::contracts::{RenderResult, StageName, StageStatus, TaskStatus};
use loom_core::error::LoomError;
use loom_core::traits::{
    DirectVideoGenerator, ScriptParser, ShotIllustrator, StoryboardPlanner, VideoAssembler,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 生成経路。モードに応じて起動時にどちらか一方が選ばれる。
pub enum GenerationPath {
    /// SD 作画 + FFmpeg レンダリング
    ImageRender {
        illustrator: Arc<dyn ShotIllustrator>,
        assembler: Arc<dyn VideoAssembler>,
    },
    /// 文生視頻 API への直行
    DirectVideo {
        generator: Arc<dyn DirectVideoGenerator>,
    },
}

pub struct PipelineRunner {
    registry: Arc<TaskRegistry>,
    parser: Arc<dyn ScriptParser>,
    planner: Arc<dyn StoryboardPlanner>,
    path: GenerationPath,
    max_shots: usize,
    nominal_resolution: String,
}

/// ステージ処理をキャンセルと競わせる
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, LoomError>>,
) -> Result<T, LoomError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LoomError::Cancelled),
        res = fut => res,
    }
}

impl PipelineRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        parser: Arc<dyn ScriptParser>,
        planner: Arc<dyn StoryboardPlanner>,
        path: GenerationPath,
        max_shots: usize,
        nominal_resolution: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            parser,
            planner,
            path,
            max_shots,
            nominal_resolution: nominal_resolution.into(),
        }
    }

    /// タスクを末端まで処理する。タスクがレジストリに無ければ何もしない
    /// （実行前に DELETE された場合の正常系）。
    pub async fn run(&self, task_id: &str, cancel: CancellationToken) {
        let Some(task) = self.registry.get(task_id).await else {
            warn!("🏭 Pipeline: Task vanished before start, skipping: {}", task_id);
            return;
        };

        info!("🏭 Pipeline: Starting task {} ({} chars)", task_id, task.input.text.len());
        let input = task.input.clone();

        self.mutate(task_id, |t| {
            t.status = TaskStatus::Processing;
        })
        .await;

        // ステージ 1: 剧本解析
        self.stage_start(task_id, StageName::ParseScript).await;
        let parsed = match guarded(&cancel, self.parser.parse(task_id, &input.text)).await {
            Ok(parsed) => parsed,
            Err(e) => return self.fail_task(task_id, StageName::ParseScript, e).await,
        };
        self.stage_done(task_id, StageName::ParseScript).await;

        // ステージ 2: 分鏡設計
        self.stage_start(task_id, StageName::GenerateStoryboard).await;
        let mut storyboard = match guarded(
            &cancel,
            self.planner
                .plan(task_id, &parsed, input.options.duration_target),
        )
        .await
        {
            Ok(storyboard) => storyboard,
            Err(e) => return self.fail_task(task_id, StageName::GenerateStoryboard, e).await,
        };
        // ポリシーガード: ショット数の上限検査は分鏡完了の前に行う
        if storyboard.shots.len() > self.max_shots {
            let e = LoomError::ShotBudget {
                shots: storyboard.shots.len(),
                limit: self.max_shots,
            };
            return self.fail_task(task_id, StageName::GenerateStoryboard, e).await;
        }
        self.stage_done(task_id, StageName::GenerateStoryboard).await;

        // ステージ 3, 4: 経路分岐
        let result = match &self.path {
            GenerationPath::DirectVideo { generator } => {
                // 直行パス: 1回の外部生成が作画とレンダリングの両方を内包する。
                // 作画ステージだけを進行中にし、失敗もそこに帰属させる。
                // render_video は成功時にまとめて完了扱いにする。
                self.stage_start(task_id, StageName::GenerateImages).await;
                match generator.generate(task_id, &storyboard, &cancel).await {
                    Ok(clip) => {
                        self.stage_done(task_id, StageName::GenerateImages).await;
                        RenderResult {
                            video_path: clip.video_path,
                            duration: storyboard.total_duration,
                            resolution: self.nominal_resolution.clone(),
                            file_size: clip.file_size,
                            thumbnail_path: None,
                            shot_count: storyboard.shots.len(),
                        }
                    }
                    Err(e) => return self.fail_task(task_id, StageName::GenerateImages, e).await,
                }
            }
            GenerationPath::ImageRender {
                illustrator,
                assembler,
            } => {
                self.stage_start(task_id, StageName::GenerateImages).await;
                let hook = self.progress_hook(task_id);
                if let Err(e) = guarded(
                    &cancel,
                    illustrator.illustrate_all(task_id, &mut storyboard, hook),
                )
                .await
                {
                    return self.fail_task(task_id, StageName::GenerateImages, e).await;
                }
                self.stage_done(task_id, StageName::GenerateImages).await;

                self.stage_start(task_id, StageName::RenderVideo).await;
                let bgm = input.options.bgm.clone();
                let bgm = if bgm.is_empty() { None } else { Some(bgm) };
                match guarded(
                    &cancel,
                    assembler.assemble(task_id, &storyboard, bgm.as_deref()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(e) => return self.fail_task(task_id, StageName::RenderVideo, e).await,
                }
            }
        };

        self.mutate(task_id, |t| {
            t.update_stage(StageName::RenderVideo, StageStatus::Completed);
            t.complete(result.clone());
        })
        .await;
        info!(
            "🏭 Pipeline: Task {} completed -> {} ({} shots, {:.1}s)",
            task_id, result.video_path, result.shot_count, result.duration
        );
    }

    /// ショット単位の進捗をレジストリに書き戻すフック。
    /// 永続化が終わるまで作画側は次のショットに進まない。
    fn progress_hook(&self, task_id: &str) -> loom_core::traits::ProgressHook {
        let registry = self.registry.clone();
        let task_id = task_id.to_string();
        Box::new(move |current, total| {
            let registry = registry.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                let pct = if total == 0 {
                    100
                } else {
                    (current * 100 / total) as u8
                };
                if let Some(mut task) = registry.get(&task_id).await {
                    task.set_stage_progress(
                        StageName::GenerateImages,
                        pct,
                        format!("{current}/{total} shots"),
                    );
                    // タスク全体の進捗は作画ステージのサブ進捗そのもの
                    task.progress = pct;
                    if let Err(e) = registry.update(task).await {
                        warn!("🏭 Pipeline: Progress update lost for {}: {}", task_id, e);
                    }
                }
            })
        })
    }

    async fn stage_start(&self, task_id: &str, stage: StageName) {
        info!("🏭 Pipeline: Stage {} started (task: {})", stage, task_id);
        self.mutate(task_id, |t| t.update_stage(stage, StageStatus::Processing))
            .await;
    }

    async fn stage_done(&self, task_id: &str, stage: StageName) {
        info!("🏭 Pipeline: Stage {} completed (task: {})", stage, task_id);
        self.mutate(task_id, move |t| t.update_stage(stage, StageStatus::Completed))
            .await;
    }

    /// 失敗の一本道。ステージを failed に落とし、タスクをエラー付きで終える。
    async fn fail_task(&self, task_id: &str, stage: StageName, e: LoomError) {
        error!("🏭 Pipeline: Task {} failed at {}: {}", task_id, stage, e);
        let message = e.to_string();
        self.mutate(task_id, move |t| {
            t.update_stage(stage, StageStatus::Failed);
            t.fail(message);
        })
        .await;
    }

    /// スナップショットを読み、変更し、書き戻す。タスクが消えていれば黙って諦める。
    async fn mutate(&self, task_id: &str, f: impl FnOnce(&mut loom_core::contracts::Task)) {
        if let Some(mut task) = self.registry.get(task_id).await {
            f(&mut task);
            if let Err(e) = self.registry.update(task).await {
                warn!("🏭 Pipeline: State update lost for {}: {}", task_id, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use async_trait::async_trait;
    use loom_core::contracts::{
        GeneratedClip, ParsedScript, RenderResult, Scene, Shot, Storyboard,
    };
    use loom_core::error::LoomError;
    use loom_core::traits::{
        DirectVideoGenerator, ProgressHook, ScriptParser, ShotIllustrator, StoryboardPlanner,
        VideoAssembler,
    };
    use tokio_util::sync::CancellationToken;

    pub fn shot(id: u32) -> Shot {
        Shot {
            id,
            shot_type: "medium".to_string(),
            description: format!("shot {id}"),
            characters: vec![],
            duration: 4.0,
            transition: "cut".to_string(),
            dialogue: None,
            image_path: String::new(),
            prompt: format!("prompt {id}"),
        }
    }

    pub struct MockParser {
        pub fail: bool,
    }

    #[async_trait]
    impl ScriptParser for MockParser {
        async fn parse(&self, _task_id: &str, _text: &str) -> Result<ParsedScript, LoomError> {
            if self.fail {
                return Err(LoomError::LlmResponse {
                    source: anyhow::anyhow!("model returned garbage"),
                });
            }
            Ok(ParsedScript {
                scenes: vec![Scene {
                    id: 1,
                    location: "home".to_string(),
                    time: "day".to_string(),
                    characters: vec![],
                    dialogues: vec![],
                    actions: vec![],
                }],
                characters: vec![],
                metadata: Default::default(),
            })
        }
    }

    pub struct MockPlanner {
        pub shots: usize,
    }

    #[async_trait]
    impl StoryboardPlanner for MockPlanner {
        async fn plan(
            &self,
            _task_id: &str,
            _parsed: &ParsedScript,
            _target: u32,
        ) -> Result<Storyboard, LoomError> {
            Ok(Storyboard {
                shots: (1..=self.shots as u32).map(shot).collect(),
                total_duration: self.shots as f64 * 4.0,
            })
        }
    }

    pub struct MockIllustrator;

    #[async_trait]
    impl ShotIllustrator for MockIllustrator {
        async fn illustrate_all(
            &self,
            _task_id: &str,
            storyboard: &mut Storyboard,
            on_progress: ProgressHook,
        ) -> Result<(), LoomError> {
            let total = storyboard.shots.len();
            for (i, shot) in storyboard.shots.iter_mut().enumerate() {
                shot.image_path = format!("/tmp/shot_{:03}.png", shot.id);
                on_progress(i + 1, total).await;
            }
            Ok(())
        }
    }

    pub struct MockAssembler;

    #[async_trait]
    impl VideoAssembler for MockAssembler {
        async fn assemble(
            &self,
            _task_id: &str,
            storyboard: &Storyboard,
            _bgm: Option<&str>,
        ) -> Result<RenderResult, LoomError> {
            Ok(RenderResult {
                video_path: "/tmp/output.mp4".to_string(),
                duration: storyboard.total_duration,
                resolution: "1920x1080".to_string(),
                file_size: 2048,
                thumbnail_path: None,
                shot_count: storyboard.shots.len(),
            })
        }
    }

    pub struct MockDirect {
        pub fail: bool,
    }

    #[async_trait]
    impl DirectVideoGenerator for MockDirect {
        async fn generate(
            &self,
            _task_id: &str,
            _storyboard: &Storyboard,
            _cancel: &CancellationToken,
        ) -> Result<GeneratedClip, LoomError> {
            if self.fail {
                return Err(LoomError::PollTimeout {
                    checks: 60,
                    waited_secs: 600,
                });
            }
            Ok(GeneratedClip {
                video_path: "/tmp/direct.mp4".to_string(),
                file_size: 4096,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;
    use loom_core::contracts::{GenerationInput, GenerationOptions, Task};

    fn image_runner(registry: Arc<TaskRegistry>, max_shots: usize, shots: usize) -> PipelineRunner {
        PipelineRunner::new(
            registry,
            Arc::new(MockParser { fail: false }),
            Arc::new(MockPlanner { shots }),
            GenerationPath::ImageRender {
                illustrator: Arc::new(MockIllustrator),
                assembler: Arc::new(MockAssembler),
            },
            max_shots,
            "1920x1080",
        )
    }

    async fn seed_task(registry: &TaskRegistry, id: &str) {
        let mut options = GenerationOptions::default();
        options.apply_defaults("gentle.mp3");
        registry
            .create(Task::new(
                id,
                GenerationInput {
                    text: "昔々あるところに。".to_string(),
                    options,
                },
            ))
            .await;
    }

    #[tokio::test]
    async fn test_image_path_completes_all_stages() {
        let registry = Arc::new(TaskRegistry::new());
        seed_task(&registry, "t-1").await;
        let runner = image_runner(registry.clone(), 30, 3);

        runner.run("t-1", CancellationToken::new()).await;

        let task = registry.get("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.steps.iter().all(|s| s.status == StageStatus::Completed));
        let result = task.result.unwrap();
        assert_eq!(result.shot_count, 3);
        assert_eq!(result.video_path, "/tmp/output.mp4");
        // ショット進捗が作画ステージに残っている
        assert_eq!(task.steps[2].progress, Some(100));
        assert_eq!(task.steps[2].current.as_deref(), Some("3/3 shots"));
    }

    #[tokio::test]
    async fn test_direct_path_collapses_trailing_stages() {
        let registry = Arc::new(TaskRegistry::new());
        seed_task(&registry, "t-2").await;
        let runner = PipelineRunner::new(
            registry.clone(),
            Arc::new(MockParser { fail: false }),
            Arc::new(MockPlanner { shots: 5 }),
            GenerationPath::DirectVideo {
                generator: Arc::new(MockDirect { fail: false }),
            },
            30,
            "1920x1080",
        );

        runner.run("t-2", CancellationToken::new()).await;

        let task = registry.get("t-2").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.steps.iter().all(|s| s.status == StageStatus::Completed));
        let result = task.result.unwrap();
        assert_eq!(result.video_path, "/tmp/direct.mp4");
        assert_eq!(result.file_size, 4096);
        assert_eq!(result.shot_count, 5);
        assert_eq!(result.resolution, "1920x1080");
        // 尺は分鏡の合計から合成される
        assert_eq!(result.duration, 20.0);
        // render_video は単独では実行されず、成功時にまとめて完了になる
        assert!(task.steps[3].start_at.is_none());
        assert!(task.steps[3].duration.is_none());
    }

    #[tokio::test]
    async fn test_shot_budget_violation_fails_storyboard_stage() {
        let registry = Arc::new(TaskRegistry::new());
        seed_task(&registry, "t-3").await;
        let runner = image_runner(registry.clone(), 4, 5);

        runner.run("t-3", CancellationToken::new()).await;

        let task = registry.get("t-3").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps[0].status, StageStatus::Completed);
        assert_eq!(task.steps[1].status, StageStatus::Failed);
        assert_eq!(task.steps[2].status, StageStatus::Pending);
        assert_eq!(task.steps[3].status, StageStatus::Pending);
        // 作画ステージが走る前のタスク進捗は 0 のまま
        assert_eq!(task.progress, 0);
        let error = task.error.unwrap();
        assert!(error.contains('5'));
        assert!(error.contains('4'));
    }

    #[tokio::test]
    async fn test_parse_failure_leaves_later_stages_pending() {
        let registry = Arc::new(TaskRegistry::new());
        seed_task(&registry, "t-4").await;
        let runner = PipelineRunner::new(
            registry.clone(),
            Arc::new(MockParser { fail: true }),
            Arc::new(MockPlanner { shots: 3 }),
            GenerationPath::ImageRender {
                illustrator: Arc::new(MockIllustrator),
                assembler: Arc::new(MockAssembler),
            },
            30,
            "1920x1080",
        );

        runner.run("t-4", CancellationToken::new()).await;

        let task = registry.get("t-4").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps[0].status, StageStatus::Failed);
        assert!(task.steps[1..]
            .iter()
            .all(|s| s.status == StageStatus::Pending));
        assert!(task.result.is_none());
        assert!(task.error.is_some());
        assert_eq!(task.progress, 0);
    }

    #[tokio::test]
    async fn test_direct_path_poll_timeout_fails_image_stage() {
        let registry = Arc::new(TaskRegistry::new());
        seed_task(&registry, "t-5").await;
        let runner = PipelineRunner::new(
            registry.clone(),
            Arc::new(MockParser { fail: false }),
            Arc::new(MockPlanner { shots: 2 }),
            GenerationPath::DirectVideo {
                generator: Arc::new(MockDirect { fail: true }),
            },
            30,
            "1920x1080",
        );

        runner.run("t-5", CancellationToken::new()).await;

        // 直行パスの失敗は作画ステージに帰属し、render_video は手付かずで残る
        let task = registry.get("t-5").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps[2].status, StageStatus::Failed);
        assert_eq!(task.steps[3].status, StageStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.error.unwrap().contains("600"));
    }

    #[tokio::test]
    async fn test_vanished_task_is_skipped() {
        let registry = Arc::new(TaskRegistry::new());
        let runner = image_runner(registry.clone(), 30, 3);
        // レジストリに存在しないタスクの実行は no-op
        runner.run("ghost", CancellationToken::new()).await;
        assert!(registry.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_fails_at_first_stage() {
        let registry = Arc::new(TaskRegistry::new());
        seed_task(&registry, "t-6").await;
        let runner = image_runner(registry.clone(), 30, 3);

        let cancel = CancellationToken::new();
        cancel.cancel();
        runner.run("t-6", cancel).await;

        let task = registry.get("t-6").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.steps[0].status, StageStatus::Failed);
    }
}
