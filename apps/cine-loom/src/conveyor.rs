//! # Conveyor — 有界キュー + 固定ワーカープール
//!
//! 受理済みタスクを容量固定の mpsc キューに積み、起動時に決めた数の
//! ワーカーだけが取り出して処理する。タスクごとの無制限 spawn はしない。
//! キューが満杯なら submit は待たずに `LineBusy` で弾く。

use crate::pipeline::PipelineRunner;
use loom_core::error::LoomError;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Conveyor {
    tx: mpsc::Sender<String>,
    capacity: usize,
}

impl Conveyor {
    /// ワーカープールを起動する。`shutdown` が取り消されるとワーカーは
    /// 取り込みを止め、実行中のタスクにもキャンセルが伝播する。
    pub fn start(
        runner: Arc<PipelineRunner>,
        worker_count: usize,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<String>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = worker_count.max(1);
        info!("🛤️ Conveyor: Starting {} workers (queue capacity: {})", workers, queue_capacity);

        for worker_id in 0..workers {
            let rx = rx.clone();
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let task_id = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = async { rx.lock().await.recv().await } => match next {
                            Some(task_id) => task_id,
                            None => break,
                        },
                    };
                    info!("🛤️ Conveyor: Worker {} picked up task {}", worker_id, task_id);
                    runner.run(&task_id, shutdown.child_token()).await;
                }
                info!("🛤️ Conveyor: Worker {} stopped", worker_id);
            });
        }

        Self {
            tx,
            capacity: queue_capacity.max(1),
        }
    }

    /// タスクをキューに積む。満杯なら待たずに失敗を返す。
    pub fn submit(&self, task_id: String) -> Result<(), LoomError> {
        self.tx.try_send(task_id).map_err(|e| {
            warn!("🛤️ Conveyor: Submission rejected: {}", e);
            LoomError::LineBusy {
                capacity: self.capacity,
            }
        })
    }
}
