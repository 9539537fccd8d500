//! The debounce worker itself (spec §4.7): absorbs bursts of inbound
//! messages per chat and triggers [`relay_pipeline::PipelineProcessor`]
//! once the chat has been quiet for the window `W`.

use crate::store::{DebounceStore, OrchestratorResult};
use relay_pipeline::PipelineProcessor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default quiescence window (spec §9: 5-10s, default 5s).
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);
/// Worker-active flag TTL; also the crash-recovery bound (spec §4.7/§9).
pub const WORKER_TTL: Duration = Duration::from_secs(60);
const POLL_CAP: Duration = Duration::from_secs(5);
const SETTLE_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct DebounceOrchestrator {
    store: Arc<dyn DebounceStore>,
    pipeline: Arc<dyn PipelineProcessor>,
    window: Duration,
    shutdown: Arc<AtomicBool>,
}

impl DebounceOrchestrator {
    pub fn new(store: Arc<dyn DebounceStore>, pipeline: Arc<dyn PipelineProcessor>) -> Self {
        Self { store, pipeline, window: DEBOUNCE_WINDOW, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Asks every running worker to stop polling for new deadlines after its
    /// current cycle; a worker already running a pipeline call finishes it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Spec §4.7 `enqueue`: upserts the run deadline and spawns a worker iff
    /// none is already alive for this chat.
    pub async fn enqueue(&self, chat_id: Uuid, msg_id: Uuid, priority: &str) -> OrchestratorResult<()> {
        let run_at = now_unix() + self.window.as_secs() as i64;
        self.store.upsert_queue(chat_id, msg_id, priority, run_at).await?;

        if self.store.try_acquire_worker(chat_id, WORKER_TTL).await? {
            let orchestrator = self.clone();
            tokio::spawn(async move { orchestrator.run_worker(chat_id).await });
        }
        Ok(())
    }

    /// Spec §4.7 `supervise`: crash recovery at process start, respawning a
    /// worker for every chat with a queue entry but no live worker flag.
    pub async fn supervise(&self) -> OrchestratorResult<usize> {
        let orphaned = self.store.scan_orphaned_chats().await?;
        let count = orphaned.len();
        for chat_id in orphaned {
            if self.store.try_acquire_worker(chat_id, WORKER_TTL).await? {
                let orchestrator = self.clone();
                tokio::spawn(async move { orchestrator.run_worker(chat_id).await });
            }
        }
        Ok(count)
    }

    async fn run_worker(&self, chat_id: Uuid) {
        loop {
            let ctx = match self.store.read_queue(chat_id).await {
                Ok(Some(ctx)) => ctx,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(chat_id = %chat_id, error = %e, "debounce worker failed to read queue");
                    break;
                }
            };

            let delta = ctx.run_at_unix - now_unix();
            if delta as f64 > SETTLE_THRESHOLD.as_secs_f64() {
                if self.shutdown.load(Ordering::SeqCst) {
                    tracing::info!(chat_id = %chat_id, "debounce worker yielding for shutdown");
                    return;
                }
                let sleep_for = Duration::from_secs(delta.max(0) as u64).min(POLL_CAP);
                tokio::time::sleep(sleep_for).await;
                if let Err(e) = self.store.heartbeat_worker(chat_id, WORKER_TTL).await {
                    tracing::warn!(chat_id = %chat_id, error = %e, "debounce worker heartbeat failed");
                }
                continue;
            }

            // Cleared before running the pipeline call: a duplicate inbound
            // message that arrives mid-run finds no active flag and spawns
            // a fresh worker, per spec's strict-per-chat-serialization note.
            if let Err(e) = self.store.clear_queue(chat_id).await {
                tracing::warn!(chat_id = %chat_id, error = %e, "debounce worker failed to clear queue");
            }
            if let Err(e) = self.store.clear_worker(chat_id).await {
                tracing::warn!(chat_id = %chat_id, error = %e, "debounce worker failed to clear worker flag");
            }

            let outcome = self.pipeline.process(chat_id, ctx.msg_id, &ctx.priority).await;
            if !outcome.success {
                tracing::warn!(chat_id = %chat_id, reason = ?outcome.reason, "pipeline run did not succeed");
            }
            return;
        }
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDebounceStore;
    use async_trait::async_trait;
    use relay_pipeline::PipelineOutcome;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingPipeline {
        calls: AtomicUsize,
        notify: Notify,
    }

    #[async_trait]
    impl PipelineProcessor for CountingPipeline {
        async fn process(&self, _chat_id: Uuid, _latest_msg_id: Uuid, _priority: &str) -> PipelineOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
            PipelineOutcome::ok()
        }
    }

    #[tokio::test]
    async fn enqueue_runs_pipeline_once_after_window_elapses() {
        // Real (not virtual) time: the worker's deadline is computed from
        // wall-clock unix seconds, not tokio's clock, so it can't be driven
        // with `tokio::time::advance`. A short window keeps this fast.
        let store = Arc::new(InMemoryDebounceStore::new());
        let pipeline = Arc::new(CountingPipeline { calls: AtomicUsize::new(0), notify: Notify::new() });
        let orchestrator = DebounceOrchestrator::new(store, pipeline.clone()).with_window(Duration::from_secs(1));

        let chat_id = Uuid::new_v4();
        orchestrator.enqueue(chat_id, Uuid::new_v4(), "normal").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.notify.notified()).await.unwrap();
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_enqueue_while_worker_alive_does_not_spawn_another() {
        let store = Arc::new(InMemoryDebounceStore::new());
        let chat_id = Uuid::new_v4();

        assert!(store.try_acquire_worker(chat_id, Duration::from_secs(60)).await.unwrap());
        let pipeline = Arc::new(CountingPipeline { calls: AtomicUsize::new(0), notify: Notify::new() });
        let orchestrator = DebounceOrchestrator::new(store.clone(), pipeline);

        orchestrator.enqueue(chat_id, Uuid::new_v4(), "normal").await.unwrap();
        // Worker flag was already held, so enqueue must not have spawned a
        // second worker; the queue entry is still updated though.
        assert!(store.read_queue(chat_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn supervise_respawns_orphaned_queue_without_worker_flag() {
        let store = Arc::new(InMemoryDebounceStore::new());
        let chat_id = Uuid::new_v4();
        store.upsert_queue(chat_id, Uuid::new_v4(), "normal", now_unix() - 1).await.unwrap();

        let pipeline = Arc::new(CountingPipeline { calls: AtomicUsize::new(0), notify: Notify::new() });
        let orchestrator = DebounceOrchestrator::new(store.clone(), pipeline.clone());

        let respawned = orchestrator.supervise().await.unwrap();
        assert_eq!(respawned, 1);

        tokio::time::timeout(Duration::from_secs(1), pipeline.notify.notified()).await.unwrap();
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
    }
}
