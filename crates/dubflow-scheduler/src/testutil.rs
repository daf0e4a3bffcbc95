//! Shared fixtures for scheduler tests: an in-memory store, a tempdir task
//! tree, and a mock worker that answers each stage's request the way a real
//! worker would.

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bus::ProgressBus;
use crate::lock::GlobalRunLock;
use crate::runner::StageRunner;
use crate::subscribers::SubscriberRegistry;
use dubflow_config::RuntimeProfiles;
use dubflow_core::paths::PathManager;
use dubflow_core::subtitle::parse_srt;
use dubflow_core::task::Task;
use dubflow_core::worker::{CancelToken, Worker, WorkerJob, WorkerProgress};
use dubflow_core::{Error, Result, Stage, TaskId};
use dubflow_db::{NewTask, SqliteTaskStore, TaskStore, run_migrations};

pub const FIXTURE_SRT: &str = "\
1
00:00:01,000 --> 00:00:02,000
Line one.

2
00:00:02,500 --> 00:00:04,000
Line two.

3
00:00:04,500 --> 00:00:06,000
Line three.
";

pub struct TestEnv {
    pub _tmp: tempfile::TempDir,
    pub paths: PathManager,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub lock: Arc<GlobalRunLock>,
    pub bus: Arc<ProgressBus>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        let paths = PathManager::new(tmp.path());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
        let registry = Arc::new(SubscriberRegistry::new());
        let lock = Arc::new(GlobalRunLock::new());
        let bus = Arc::new(ProgressBus::new(store.clone(), registry.clone(), lock.clone()));

        Self {
            _tmp: tmp,
            paths,
            store,
            registry,
            lock,
            bus,
        }
    }

    pub fn runner(&self, worker: Arc<dyn Worker>) -> Arc<StageRunner> {
        Arc::new(StageRunner::new(
            self.store.clone(),
            self.bus.clone(),
            self.lock.clone(),
            worker,
            self.paths.clone(),
            RuntimeProfiles::default(),
        ))
    }

    /// Create a task row plus its on-disk layout; optionally with the
    /// three-line fixture subtitle in place.
    pub async fn create_task(&self, original_name: &str, with_subtitle: bool) -> Task {
        let task_id = TaskId::new();
        let paths = self.paths.task(task_id);
        paths.ensure_layout().await.unwrap();

        let stored_name = paths.stored_video_name(original_name);
        tokio::fs::write(paths.stored_video(&stored_name), b"video-bytes")
            .await
            .unwrap();
        if with_subtitle {
            tokio::fs::write(paths.source_subtitle(), FIXTURE_SRT)
                .await
                .unwrap();
        }

        self.store
            .create(NewTask {
                task_id,
                video_original_name: original_name.to_string(),
                video_stored_name: stored_name,
                source_subtitle_present: with_subtitle,
            })
            .await
            .unwrap()
    }
}

/// A worker that reads the request document and fabricates the response a
/// real stage worker would produce, writing the promised artifacts.
pub struct MockWorker {
    pub delay: Duration,
    pub fail_stages: HashSet<Stage>,
    /// Stages that never finish on their own; they only exit on cancel.
    pub hang_stages: HashSet<Stage>,
}

impl Default for MockWorker {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(20),
            fail_stages: HashSet::new(),
            hang_stages: HashSet::new(),
        }
    }
}

impl MockWorker {
    pub fn failing(stage: Stage) -> Self {
        Self {
            fail_stages: HashSet::from([stage]),
            ..Self::default()
        }
    }

    pub fn hanging(stage: Stage) -> Self {
        Self {
            hang_stages: HashSet::from([stage]),
            ..Self::default()
        }
    }

    async fn respond(&self, job: &WorkerJob) -> Result<Value> {
        match job.stage {
            Stage::SpeakerDiarization => {
                let subtitle_path = job.request["subtitle_path"]
                    .as_str()
                    .ok_or_else(|| Error::WorkerFailed("missing subtitle_path".to_string()))?;
                let text = tokio::fs::read_to_string(subtitle_path).await?;
                let lines = parse_srt(&text)?;
                let labels: Vec<i64> = (0..lines.len()).map(|i| (i % 2) as i64).collect();
                let speakers = labels.iter().collect::<HashSet<_>>().len();
                Ok(json!({
                    "speaker_labels": labels,
                    "speaker_name_mapping": {"0": "男1", "1": "女2"},
                    "gender_dict": {"0": "male", "1": "female"},
                    "unique_speakers": speakers,
                }))
            }
            Stage::Translation => {
                let tasks = job.request["tasks"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                let results: Vec<Value> = tasks
                    .iter()
                    .map(|t| {
                        json!({
                            "task_id": t["task_id"],
                            "source": t["source"],
                            "translation": format!(
                                "{} [{}]",
                                t["source"].as_str().unwrap_or_default(),
                                t["target_language"].as_str().unwrap_or_default()
                            ),
                        })
                    })
                    .collect();
                Ok(Value::Array(results))
            }
            Stage::VoiceCloning => {
                let tasks = job.request["tasks"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                let mut results = Vec::new();
                for t in &tasks {
                    let output_file = t["output_file"].as_str().unwrap_or_default();
                    tokio::fs::write(output_file, b"wav").await?;
                    results.push(json!({
                        "segment_index": t["segment_index"],
                        "status": "success",
                        "output_file": output_file,
                        "inference_time": 0.05,
                    }));
                }
                Ok(Value::Array(results))
            }
            Stage::Stitch => {
                let subtitle_path = job.request["subtitle_path"].as_str().unwrap_or_default();
                let output_path = job.request["output_path"].as_str().unwrap_or_default();
                let text = tokio::fs::read_to_string(subtitle_path).await?;
                let lines = parse_srt(&text)?;
                tokio::fs::write(output_path, b"riff").await?;
                let segments: Vec<Value> = lines
                    .iter()
                    .enumerate()
                    .map(|(i, line)| {
                        json!({
                            "index": i,
                            "actual_start_time": line.start_time,
                            "actual_end_time": line.end_time + 0.05,
                        })
                    })
                    .collect();
                Ok(json!({"output_path": output_path, "segments": segments}))
            }
            Stage::Export => {
                let output_path = job.request["output_path"].as_str().unwrap_or_default();
                tokio::fs::write(output_path, b"mp4").await?;
                Ok(json!({"output_path": output_path}))
            }
        }
    }
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(
        &self,
        job: WorkerJob,
        progress: mpsc::Sender<WorkerProgress>,
        cancel: CancelToken,
    ) -> Result<Value> {
        let _ = progress.try_send(WorkerProgress {
            percent: Some(10),
            message: Some(format!("[{}] mock started", job.stage)),
        });

        if self.hang_stages.contains(&job.stage) {
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }

        let _ = progress.try_send(WorkerProgress {
            percent: Some(80),
            message: None,
        });

        if self.fail_stages.contains(&job.stage) {
            return Err(Error::WorkerFailed("mock worker failure".to_string()));
        }
        self.respond(&job).await
    }
}

/// Convenience: speaker voice mapping fixture matching the mock diarizer.
pub fn voice_mapping() -> HashMap<String, String> {
    HashMap::from([
        ("男1".to_string(), "voice_m1".to_string()),
        ("女2".to_string(), "voice_f2".to_string()),
    ])
}
