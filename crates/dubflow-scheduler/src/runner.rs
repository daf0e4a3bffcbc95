//! The stage runner: executes one `(task, language, stage)` end to end.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::ProgressBus;
use crate::lock::{Admission, GlobalRunLock};
use dubflow_config::RuntimeProfiles;
use dubflow_core::paths::{PathManager, TaskPaths};
use dubflow_core::subtitle::{SubtitleLine, parse_srt, render_srt};
use dubflow_core::task::{StageRunStatus, Task};
use dubflow_core::worker::{
    CancelToken, CloningLineResult, CloningLineTask, CloningRequest, DiarizationOutput,
    DiarizationRequest, ExportRequest, StitchOutput, StitchRequest, TranslationLineResult,
    TranslationLineTask, TranslationRequest, Worker, WorkerJob, WorkerProgress,
};
use dubflow_core::{DEFAULT_LANG, Error, Result, Stage, TaskId};
use dubflow_db::TaskStore;

#[derive(Clone)]
pub struct StageRunner {
    store: Arc<dyn TaskStore>,
    bus: Arc<ProgressBus>,
    lock: Arc<GlobalRunLock>,
    worker: Arc<dyn Worker>,
    paths: PathManager,
    profiles: RuntimeProfiles,
}

impl StageRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: Arc<ProgressBus>,
        lock: Arc<GlobalRunLock>,
        worker: Arc<dyn Worker>,
        paths: PathManager,
        profiles: RuntimeProfiles,
    ) -> Self {
        Self {
            store,
            bus,
            lock,
            worker,
            paths,
            profiles,
        }
    }

    /// Fire-and-forget entry point for HTTP triggers. Admission (and thus
    /// duplicate-trigger detection) happens before this returns; the run
    /// itself continues in the background.
    pub fn trigger(&self, task_id: TaskId, language: String, stage: Stage) -> Result<()> {
        validate_language(&language, stage)?;
        let admission = self.lock.admit(task_id, &language, stage)?;
        let runner = self.clone();
        tokio::spawn(async move {
            let _ = runner.run_admitted(admission, CancelToken::new()).await;
        });
        Ok(())
    }

    /// Synchronous entry point for the batch scheduler: resolves once the
    /// stage reached a terminal state.
    pub async fn run_stage(
        &self,
        task_id: TaskId,
        language: &str,
        stage: Stage,
        cancel: CancelToken,
    ) -> Result<()> {
        validate_language(language, stage)?;
        let admission = self.lock.admit(task_id, language, stage)?;
        self.run_admitted(admission, cancel).await
    }

    async fn run_admitted(&self, admission: Admission, cancel: CancelToken) -> Result<()> {
        let (task_id, language, stage) = admission.key();
        let guard = self.lock.acquire(admission, cancel.clone()).await;

        let last_progress = Arc::new(AtomicU8::new(0));
        let result = self
            .execute(task_id, &language, stage, cancel, last_progress.clone())
            .await;

        if let Err(err) = &result {
            let message = err.to_string();
            error!(%task_id, %language, %stage, kind = err.kind(), error = %message, "stage failed");
            if let Err(publish_err) = self
                .bus
                .publish(
                    task_id,
                    &language,
                    stage,
                    StageRunStatus::Failed,
                    last_progress.load(Ordering::SeqCst),
                    Some(message),
                )
                .await
            {
                error!(%task_id, %stage, error = %publish_err, "could not record stage failure");
            }
        }

        drop(guard);
        result
    }

    async fn execute(
        &self,
        task_id: TaskId,
        language: &str,
        stage: Stage,
        cancel: CancelToken,
        last_progress: Arc<AtomicU8>,
    ) -> Result<()> {
        self.bus
            .publish(
                task_id,
                language,
                stage,
                StageRunStatus::Processing,
                0,
                Some(format!("starting {stage}")),
            )
            .await?;

        let task = self.store.get(task_id).await?;
        let paths = self.paths.task(task_id);

        // A manually triggered language becomes a target language so the
        // derived overall status accounts for it.
        if !stage.is_task_global() && !task.config.target_languages.iter().any(|l| l == language) {
            let mut languages = task.config.target_languages.clone();
            languages.push(language.to_string());
            self.store.set_target_languages(task_id, languages).await?;
        }

        let request = self.build_request(&task, &paths, language, stage).await?;
        let job = WorkerJob {
            task_id,
            language: language.to_string(),
            stage,
            request_path: paths.stage_request(stage, language),
            request,
            timeout: self.profiles.timeout(stage),
        };

        let (tx, mut rx) = mpsc::channel::<WorkerProgress>(64);
        let pump = {
            let bus = self.bus.clone();
            let language = language.to_string();
            let last_progress = last_progress.clone();
            tokio::spawn(async move {
                while let Some(observation) = rx.recv().await {
                    // Worker-reported percentages are coerced monotonic and
                    // capped below 100; only completion publishes 100.
                    let previous = last_progress.load(Ordering::SeqCst);
                    let next = observation
                        .percent
                        .map(|p| p.min(99).max(previous))
                        .unwrap_or(previous);
                    last_progress.store(next, Ordering::SeqCst);
                    if let Err(err) = bus
                        .publish(
                            task_id,
                            &language,
                            stage,
                            StageRunStatus::Processing,
                            next,
                            observation.message,
                        )
                        .await
                    {
                        warn!(%task_id, %stage, error = %err, "progress publish failed");
                    }
                }
            })
        };

        let outcome = self.worker.invoke(job, tx, cancel).await;
        let _ = pump.await;
        let value = outcome?;

        let message = self.persist_outputs(&task, &paths, language, stage, value).await?;
        info!(%task_id, %language, %stage, "stage completed");
        self.bus
            .publish(
                task_id,
                language,
                stage,
                StageRunStatus::Completed,
                100,
                Some(message),
            )
            .await?;
        Ok(())
    }

    async fn build_request(
        &self,
        task: &Task,
        paths: &TaskPaths,
        language: &str,
        stage: Stage,
    ) -> Result<Value> {
        let request = match stage {
            Stage::SpeakerDiarization => {
                let _ = self.read_source_lines(task, paths).await?;
                serde_json::to_value(DiarizationRequest {
                    task_id: task.task_id,
                    video_path: paths.stored_video(&task.video_stored_name),
                    audio_path: paths.audio_wav(),
                    subtitle_path: paths.source_subtitle(),
                    segments_dir: paths.speaker_segments_dir(),
                })?
            }
            Stage::Translation => {
                let lines = self.read_source_lines(task, paths).await?;
                paths.ensure_language_layout(language).await?;
                let tasks = lines
                    .iter()
                    .enumerate()
                    .map(|(i, line)| TranslationLineTask {
                        task_id: i.to_string(),
                        source: line.text.clone(),
                        target_language: language.to_string(),
                    })
                    .collect();
                serde_json::to_value(TranslationRequest {
                    tasks,
                    model_path: None,
                    num_processes: 1,
                })?
            }
            Stage::VoiceCloning => {
                let lines = read_translated_lines(paths, language).await?;
                let speakers = read_speaker_data(paths).await?;
                paths.ensure_language_layout(language).await?;
                let tasks = lines
                    .iter()
                    .enumerate()
                    .map(|(i, line)| {
                        let label = speakers.speaker_labels.get(i).copied().unwrap_or(0);
                        let speaker_name = speakers
                            .speaker_name_mapping
                            .get(&label.to_string())
                            .cloned()
                            .unwrap_or_else(|| format!("speaker_{label}"));
                        let reference = task
                            .config
                            .speaker_voice_mapping
                            .get(&speaker_name)
                            .cloned();
                        CloningLineTask {
                            segment_index: i,
                            speaker_name,
                            reference,
                            target_text: line.text.clone(),
                            output_file: paths.cloned_segment(language, i),
                        }
                    })
                    .collect();
                serde_json::to_value(CloningRequest {
                    model_dir: None,
                    tasks,
                })?
            }
            Stage::Stitch => {
                let _ = read_translated_lines(paths, language).await?;
                serde_json::to_value(StitchRequest {
                    language: language.to_string(),
                    segments_dir: paths.cloned_audio_dir(language),
                    subtitle_path: paths.translated_srt(language),
                    output_path: paths.stitched_audio(language),
                })?
            }
            Stage::Export => {
                if !paths.stitched_audio(language).is_file() {
                    return Err(Error::InvalidInput(format!(
                        "no stitched audio for {language}; run stitch first"
                    )));
                }
                serde_json::to_value(ExportRequest {
                    language: language.to_string(),
                    video_path: paths.stored_video(&task.video_stored_name),
                    audio_path: paths.stitched_audio(language),
                    output_path: paths.final_video(language),
                    container: task.config.export.container.clone(),
                    keep_original_audio: task.config.export.keep_original_audio,
                })?
            }
        };
        Ok(request)
    }

    /// Apply the stage's artifact contract to the worker's final document.
    /// Returns the completion message.
    async fn persist_outputs(
        &self,
        task: &Task,
        paths: &TaskPaths,
        language: &str,
        stage: Stage,
        value: Value,
    ) -> Result<String> {
        match stage {
            Stage::SpeakerDiarization => {
                let output: DiarizationOutput = serde_json::from_value(value)
                    .map_err(|e| Error::WorkerFailed(format!("malformed diarization output: {e}")))?;
                let lines = self.read_source_lines(task, paths).await?;
                if output.speaker_labels.len() != lines.len() {
                    return Err(Error::WorkerFailed(format!(
                        "speaker labels ({}) do not align with subtitle lines ({})",
                        output.speaker_labels.len(),
                        lines.len()
                    )));
                }
                tokio::fs::write(paths.speaker_data(), serde_json::to_vec_pretty(&output)?).await?;
                Ok(format!("{} speakers detected", output.unique_speakers))
            }
            Stage::Translation => {
                let results: Vec<TranslationLineResult> = serde_json::from_value(value)
                    .map_err(|e| Error::WorkerFailed(format!("malformed translation output: {e}")))?;
                let source = self.read_source_lines(task, paths).await?;
                if results.len() != source.len() {
                    return Err(Error::WorkerFailed(format!(
                        "translation returned {} lines, expected {}",
                        results.len(),
                        source.len()
                    )));
                }
                let by_id: HashMap<&str, &TranslationLineResult> =
                    results.iter().map(|r| (r.task_id.as_str(), r)).collect();
                let mut translated = Vec::with_capacity(source.len());
                for (i, line) in source.iter().enumerate() {
                    let result = by_id.get(i.to_string().as_str()).ok_or_else(|| {
                        Error::WorkerFailed(format!("translation missing line {i}"))
                    })?;
                    // Line count and time ranges are preserved from the
                    // source; only the text changes.
                    translated.push(SubtitleLine {
                        index: line.index,
                        start_time: line.start_time,
                        end_time: line.end_time,
                        text: result.translation.clone(),
                    });
                }
                tokio::fs::write(paths.translated_srt(language), render_srt(&translated)).await?;
                Ok(format!("translated {} lines", translated.len()))
            }
            Stage::VoiceCloning => {
                let results: Vec<CloningLineResult> = serde_json::from_value(value)
                    .map_err(|e| Error::WorkerFailed(format!("malformed cloning output: {e}")))?;
                let failed: Vec<usize> = results
                    .iter()
                    .filter(|r| !matches!(r.status.as_str(), "success" | "ok" | "completed"))
                    .map(|r| r.segment_index)
                    .collect();
                if !failed.is_empty() {
                    return Err(Error::WorkerFailed(format!(
                        "segments failed to clone: {failed:?}"
                    )));
                }
                Ok(format!("cloned {} segments", results.len()))
            }
            Stage::Stitch => {
                let output: StitchOutput = serde_json::from_value(value)
                    .map_err(|e| Error::WorkerFailed(format!("malformed stitch output: {e}")))?;
                Ok(format!("stitched {} segments", output.segments.len()))
            }
            Stage::Export => Ok("export finished".to_string()),
        }
    }

    async fn read_source_lines(&self, task: &Task, paths: &TaskPaths) -> Result<Vec<SubtitleLine>> {
        if !task.source_subtitle_present {
            return Err(Error::InvalidInput(
                "task has no source subtitle; upload one first".to_string(),
            ));
        }
        let text = tokio::fs::read_to_string(paths.source_subtitle())
            .await
            .map_err(|_| Error::InvalidInput("source subtitle file missing".to_string()))?;
        parse_srt(&text)
    }
}

fn validate_language(language: &str, stage: Stage) -> Result<()> {
    if language.is_empty() {
        return Err(Error::InvalidInput("language tag is empty".to_string()));
    }
    if stage.is_task_global() && language != DEFAULT_LANG {
        return Err(Error::InvalidInput(format!(
            "{stage} runs on the reserved `{DEFAULT_LANG}` language tag"
        )));
    }
    if !stage.is_task_global() && language == DEFAULT_LANG {
        return Err(Error::InvalidInput(format!(
            "{stage} requires a concrete target language"
        )));
    }
    Ok(())
}

async fn read_translated_lines(paths: &TaskPaths, language: &str) -> Result<Vec<SubtitleLine>> {
    let text = tokio::fs::read_to_string(paths.translated_srt(language))
        .await
        .map_err(|_| {
            Error::InvalidInput(format!(
                "no translated subtitle for {language}; run translation first"
            ))
        })?;
    parse_srt(&text)
}

async fn read_speaker_data(paths: &TaskPaths) -> Result<DiarizationOutput> {
    let bytes = tokio::fs::read(paths.speaker_data()).await.map_err(|_| {
        Error::InvalidInput("no speaker data; run speaker diarization first".to_string())
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Internal(format!("corrupt speaker data: {e}")))
}
