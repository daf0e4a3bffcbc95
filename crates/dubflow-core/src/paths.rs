//! Per-task filesystem layout.
//!
//! Every path the pipeline reads or writes is derived here. No other
//! component may construct task-relative paths.
//!
//! ```text
//! <root>/<task_id>/
//!   input/     <task_id>_<original_video_name>
//!   processed/ audio.wav, source_subtitle.srt, speaker_segments/*, speaker_data.json
//!   outputs/<language>/translated.srt
//!                      cloned_audio/segment_<idx>.wav
//!                      stitched_audio.wav
//!                      final_video.mp4
//! ```

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{Result, Stage, TaskId};

/// Derives and manages the directory tree of every task under one root.
#[derive(Debug, Clone)]
pub struct PathManager {
    root: PathBuf,
}

impl PathManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn storage_root(&self) -> &Path {
        &self.root
    }

    pub fn task(&self, task_id: TaskId) -> TaskPaths {
        TaskPaths {
            task_id,
            root: self.root.join(task_id.to_string()),
        }
    }
}

/// All paths of a single task.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    task_id: TaskId,
    root: PathBuf,
}

impl TaskPaths {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    /// Stored name for the uploaded video: `<task_id>_<original_name>`.
    pub fn stored_video_name(&self, original_name: &str) -> String {
        format!("{}_{}", self.task_id, original_name)
    }

    pub fn stored_video(&self, stored_name: &str) -> PathBuf {
        self.input_dir().join(stored_name)
    }

    pub fn audio_wav(&self) -> PathBuf {
        self.processed_dir().join("audio.wav")
    }

    pub fn source_subtitle(&self) -> PathBuf {
        self.processed_dir().join("source_subtitle.srt")
    }

    pub fn speaker_segments_dir(&self) -> PathBuf {
        self.processed_dir().join("speaker_segments")
    }

    pub fn speaker_data(&self) -> PathBuf {
        self.processed_dir().join("speaker_data.json")
    }

    /// Request document handed to the external worker of `stage`.
    pub fn stage_request(&self, stage: Stage, language: &str) -> PathBuf {
        self.processed_dir()
            .join(format!("{}_{}_request.json", stage.as_str(), language))
    }

    pub fn language_dir(&self, language: &str) -> PathBuf {
        self.outputs_dir().join(language)
    }

    pub fn translated_srt(&self, language: &str) -> PathBuf {
        self.language_dir(language).join("translated.srt")
    }

    pub fn cloned_audio_dir(&self, language: &str) -> PathBuf {
        self.language_dir(language).join("cloned_audio")
    }

    pub fn cloned_segment(&self, language: &str, index: usize) -> PathBuf {
        self.cloned_audio_dir(language)
            .join(format!("segment_{index}.wav"))
    }

    pub fn stitched_audio(&self, language: &str) -> PathBuf {
        self.language_dir(language).join("stitched_audio.wav")
    }

    pub fn final_video(&self, language: &str) -> PathBuf {
        self.language_dir(language).join("final_video.mp4")
    }

    /// Create the base layout. Idempotent.
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.input_dir(),
            self.processed_dir(),
            self.speaker_segments_dir(),
            self.outputs_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Create the per-language output layout. Idempotent.
    pub async fn ensure_language_layout(&self, language: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.cloned_audio_dir(language)).await?;
        Ok(())
    }

    /// Remove the whole task tree. Best-effort: a failure is logged with the
    /// residual path instead of propagating.
    pub async fn delete_tree(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.root).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(task_id = %self.task_id, path = %self.root.display(), error = %err,
                    "residual task files left behind");
            }
        }
    }

    /// True if `path` is inside this task's root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}
