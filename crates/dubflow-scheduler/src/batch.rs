//! The batch scheduler: walks tasks through the ordered stage graph.
//!
//! ```text
//! speaker_diarization (once per task, on "default")
//!       |
//! translation -> voice_cloning -> stitch -> export      (per language)
//! ```
//!
//! Languages run sequentially; the global run lock would serialize them
//! anyway, and sequential processing keeps progress reporting and stop
//! semantics crisp. At most one batch is active process-wide.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::runner::StageRunner;
use crate::subscribers::{SubscriberRegistry, TaskEvent};
use dubflow_core::worker::CancelToken;
use dubflow_core::{DEFAULT_LANG, Error, Result, Stage, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// One task's slice of a batch.
#[derive(Debug, Clone)]
pub struct BatchTaskRequest {
    pub task_id: TaskId,
    pub languages: Vec<String>,
}

/// Point-in-time view of the batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub state: BatchState,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub total_stages: usize,
    pub completed_stages: usize,
    pub current_task: Option<TaskId>,
    pub current_language: Option<String>,
    pub current_stage: Option<Stage>,
    pub error: Option<String>,
}

struct Inner {
    state: BatchState,
    total_tasks: usize,
    completed_tasks: usize,
    total_stages: usize,
    completed_stages: usize,
    current_task: Option<TaskId>,
    current_language: Option<String>,
    current_stage: Option<Stage>,
    error: Option<String>,
    cancel: Option<CancelToken>,
}

impl Inner {
    fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            state: self.state,
            total_tasks: self.total_tasks,
            completed_tasks: self.completed_tasks,
            total_stages: self.total_stages,
            completed_stages: self.completed_stages,
            current_task: self.current_task,
            current_language: self.current_language.clone(),
            current_stage: self.current_stage,
            error: self.error.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BatchRunner {
    runner: Arc<StageRunner>,
    registry: Arc<SubscriberRegistry>,
    inner: Arc<Mutex<Inner>>,
}

impl BatchRunner {
    pub fn new(runner: Arc<StageRunner>, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            runner,
            registry,
            inner: Arc::new(Mutex::new(Inner {
                state: BatchState::Idle,
                total_tasks: 0,
                completed_tasks: 0,
                total_stages: 0,
                completed_stages: 0,
                current_task: None,
                current_language: None,
                current_stage: None,
                error: None,
                cancel: None,
            })),
        }
    }

    /// Start a batch over one or more tasks. Conflict while one is active.
    pub fn start(&self, requests: Vec<BatchTaskRequest>) -> Result<()> {
        if requests.is_empty() {
            return Err(Error::InvalidInput("batch has no tasks".to_string()));
        }
        if requests.iter().any(|r| r.languages.is_empty()) {
            return Err(Error::InvalidInput(
                "batch task has no target languages".to_string(),
            ));
        }

        let cancel = CancelToken::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(inner.state, BatchState::Running | BatchState::Stopping) {
                return Err(Error::Conflict("a batch is already running".to_string()));
            }
            inner.state = BatchState::Running;
            inner.total_tasks = requests.len();
            inner.completed_tasks = 0;
            inner.total_stages = requests.iter().map(|r| 1 + 4 * r.languages.len()).sum();
            inner.completed_stages = 0;
            inner.current_task = None;
            inner.current_language = None;
            inner.current_stage = None;
            inner.error = None;
            inner.cancel = Some(cancel.clone());
        }

        info!(tasks = requests.len(), "batch started");
        let this = self.clone();
        tokio::spawn(async move { this.run(requests, cancel).await });
        Ok(())
    }

    /// Request a cooperative stop: no further stages are launched and the
    /// current worker is asked to terminate.
    pub fn stop(&self) -> Result<()> {
        let cancel = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state != BatchState::Running {
                return Err(Error::Conflict("no batch is running".to_string()));
            }
            inner.state = BatchState::Stopping;
            inner.cancel.clone()
        };
        info!("batch stop requested");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        Ok(())
    }

    pub fn status(&self) -> BatchSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    async fn run(self, requests: Vec<BatchTaskRequest>, cancel: CancelToken) {
        let mut last_task = None;

        for request in &requests {
            last_task = Some(request.task_id);

            let mut plan = vec![(DEFAULT_LANG.to_string(), Stage::SpeakerDiarization)];
            for language in &request.languages {
                for stage in Stage::language_chain() {
                    plan.push((language.clone(), stage));
                }
            }

            for (language, stage) in plan {
                if cancel.is_cancelled() {
                    self.finish(BatchState::Stopped, None, last_task);
                    return;
                }
                self.set_current(request.task_id, &language, stage);

                match self
                    .runner
                    .run_stage(request.task_id, &language, stage, cancel.clone())
                    .await
                {
                    Ok(()) => self.bump_stage(),
                    Err(Error::Cancelled) => {
                        self.finish(BatchState::Stopped, None, last_task);
                        return;
                    }
                    Err(err) => {
                        warn!(task_id = %request.task_id, %language, %stage, error = %err,
                            "batch aborted by stage failure");
                        self.finish(BatchState::Idle, Some(err.to_string()), last_task);
                        return;
                    }
                }
            }

            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.completed_tasks += 1;
            drop(inner);
        }

        info!("batch finished");
        self.finish(BatchState::Idle, None, last_task);
    }

    fn set_current(&self, task_id: TaskId, language: &str, stage: Stage) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.current_task = Some(task_id);
            inner.current_language = Some(language.to_string());
            inner.current_stage = Some(stage);
        }
        self.broadcast_state(task_id);
    }

    fn finish(&self, state: BatchState, error: Option<String>, notify_task: Option<TaskId>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.state = state;
            inner.error = error;
            inner.current_task = None;
            inner.current_language = None;
            inner.current_stage = None;
            inner.cancel = None;
        }
        if let Some(task_id) = notify_task {
            self.broadcast_state(task_id);
        }
    }

    fn bump_stage(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.completed_stages += 1;
    }

    fn broadcast_state(&self, task_id: TaskId) {
        let snapshot = self.status();
        let state = match snapshot.state {
            BatchState::Idle => "idle",
            BatchState::Running => "running",
            BatchState::Stopping => "stopping",
            BatchState::Stopped => "stopped",
        };
        self.registry.broadcast(
            task_id,
            &TaskEvent::BatchState {
                state: state.to_string(),
                task_id: snapshot.current_task,
                language: snapshot.current_language,
                stage: snapshot.current_stage,
                completed_stages: snapshot.completed_stages,
                total_stages: snapshot.total_stages,
                error: snapshot.error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::TaskEvent;
    use crate::testutil::{MockWorker, TestEnv, voice_mapping};
    use dubflow_core::task::{OverallStatus, StageRunStatus};
    use dubflow_db::TaskStore;
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    fn batch_for(env: &TestEnv, worker: MockWorker) -> Arc<BatchRunner> {
        let runner = env.runner(Arc::new(worker));
        Arc::new(BatchRunner::new(runner, env.registry.clone()))
    }

    #[tokio::test]
    async fn full_batch_walks_every_stage() {
        let env = TestEnv::new().await;
        let batch = batch_for(&env, MockWorker::default());
        let task = env.create_task("demo.mp4", true).await;
        env.store
            .merge_speaker_voice_mapping(task.task_id, voice_mapping())
            .await
            .unwrap();
        env.store
            .set_target_languages(task.task_id, vec!["en".to_string(), "ko".to_string()])
            .await
            .unwrap();

        batch
            .start(vec![BatchTaskRequest {
                task_id: task.task_id,
                languages: vec!["en".to_string(), "ko".to_string()],
            }])
            .unwrap();

        wait_for(|| batch.status().state == BatchState::Idle && batch.status().completed_tasks == 1)
            .await;

        let snapshot = batch.status();
        assert_eq!(snapshot.completed_stages, 9);
        assert_eq!(snapshot.total_stages, 9);
        assert!(snapshot.error.is_none());

        let stored = env.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.overall_status, OverallStatus::Completed);
        for language in ["en", "ko"] {
            assert!(env.paths.task(task.task_id).final_video(language).is_file());
        }
    }

    #[tokio::test]
    async fn concurrent_start_conflicts() {
        let env = TestEnv::new().await;
        let batch = batch_for(&env, MockWorker::hanging(Stage::SpeakerDiarization));
        let task = env.create_task("demo.mp4", true).await;

        let request = || {
            vec![BatchTaskRequest {
                task_id: task.task_id,
                languages: vec!["en".to_string()],
            }]
        };
        batch.start(request()).unwrap();
        assert!(matches!(batch.start(request()), Err(Error::Conflict(_))));

        batch.stop().unwrap();
        wait_for(|| batch.status().state == BatchState::Stopped).await;
    }

    #[tokio::test]
    async fn stop_mid_stage_marks_cancelled_and_leaves_later_stages_untouched() {
        let env = TestEnv::new().await;
        let batch = batch_for(&env, MockWorker::hanging(Stage::VoiceCloning));
        let task = env.create_task("demo.mp4", true).await;
        env.store
            .merge_speaker_voice_mapping(task.task_id, voice_mapping())
            .await
            .unwrap();

        batch
            .start(vec![BatchTaskRequest {
                task_id: task.task_id,
                languages: vec!["en".to_string(), "ko".to_string()],
            }])
            .unwrap();

        // Wait until the hanging cloning stage is live, then stop.
        wait_for(|| {
            env.lock
                .current()
                .is_some_and(|record| record.stage == Stage::VoiceCloning)
        })
        .await;
        batch.stop().unwrap();

        wait_for(|| batch.status().state == BatchState::Stopped).await;
        assert!(env.lock.current().is_none());

        let stored = env.store.get(task.task_id).await.unwrap();
        let cloning = &stored.language_status["en"][&Stage::VoiceCloning];
        assert_eq!(cloning.status, StageRunStatus::Failed);
        assert!(cloning.message.as_deref().unwrap_or_default().contains("cancel"));
        // Stages after the cancelled one were never launched.
        assert!(!stored.language_status["en"].contains_key(&Stage::Stitch));
        assert!(!stored.language_status.contains_key("ko"));

        // A second stop has nothing to stop.
        assert!(matches!(batch.stop(), Err(Error::Conflict(_))));

        // A new batch may start from `stopped`.
        batch
            .start(vec![BatchTaskRequest {
                task_id: task.task_id,
                languages: vec!["en".to_string()],
            }])
            .unwrap();
        batch.stop().unwrap();
        wait_for(|| batch.status().state == BatchState::Stopped).await;
    }

    #[tokio::test]
    async fn stage_failure_ends_the_batch_with_an_error() {
        let env = TestEnv::new().await;
        let batch = batch_for(&env, MockWorker::failing(Stage::Translation));
        let task = env.create_task("demo.mp4", true).await;

        batch
            .start(vec![BatchTaskRequest {
                task_id: task.task_id,
                languages: vec!["en".to_string(), "ko".to_string()],
            }])
            .unwrap();

        wait_for(|| batch.status().state == BatchState::Idle && batch.status().error.is_some())
            .await;

        let snapshot = batch.status();
        assert!(snapshot.error.unwrap().contains("mock worker failure"));
        // Diarization completed before the failure.
        assert_eq!(snapshot.completed_stages, 1);

        let stored = env.store.get(task.task_id).await.unwrap();
        assert_eq!(stored.overall_status, OverallStatus::Failed);
        assert!(!stored.language_status.contains_key("ko"));
    }

    #[tokio::test]
    async fn batch_state_events_reach_task_subscribers() {
        let env = TestEnv::new().await;
        let batch = batch_for(&env, MockWorker::default());
        let task = env.create_task("demo.mp4", true).await;
        env.store
            .merge_speaker_voice_mapping(task.task_id, voice_mapping())
            .await
            .unwrap();
        let mut sub = env.registry.subscribe(task.task_id);

        batch
            .start(vec![BatchTaskRequest {
                task_id: task.task_id,
                languages: vec!["en".to_string()],
            }])
            .unwrap();
        wait_for(|| batch.status().state == BatchState::Idle && batch.status().completed_tasks == 1)
            .await;

        let mut states = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let TaskEvent::BatchState { state, .. } = event {
                states.push(state);
            }
        }
        assert!(states.iter().any(|s| s == "running"));
        assert_eq!(states.last().map(String::as_str), Some("idle"));
    }

    #[tokio::test]
    async fn empty_batches_are_rejected() {
        let env = TestEnv::new().await;
        let batch = batch_for(&env, MockWorker::default());
        assert!(matches!(batch.start(vec![]), Err(Error::InvalidInput(_))));
        assert!(matches!(
            batch.start(vec![BatchTaskRequest {
                task_id: TaskId::new(),
                languages: vec![],
            }]),
            Err(Error::InvalidInput(_))
        ));
    }
}
