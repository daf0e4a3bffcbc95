//! The durable task model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Stage;
use crate::TaskId;

/// Overall task status, always derived from `language_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Pending => "pending",
            OverallStatus::Processing => "processing",
            OverallStatus::Completed => "completed",
            OverallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OverallStatus::Pending),
            "processing" => Some(OverallStatus::Processing),
            "completed" => Some(OverallStatus::Completed),
            "failed" => Some(OverallStatus::Failed),
            _ => None,
        }
    }
}

/// Status of a single stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Idle,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageRunStatus::Completed | StageRunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageRunStatus::Idle => "idle",
            StageRunStatus::Processing => "processing",
            StageRunStatus::Pending => "pending",
            StageRunStatus::Completed => "completed",
            StageRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(StageRunStatus::Idle),
            "pending" => Some(StageRunStatus::Pending),
            "processing" => Some(StageRunStatus::Processing),
            "completed" => Some(StageRunStatus::Completed),
            "failed" => Some(StageRunStatus::Failed),
            _ => None,
        }
    }
}

/// State of one stage for one language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageRunStatus,
    /// Percent complete, 0..=100. Monotonic within a run.
    pub progress: u8,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageRunStatus::Idle,
            progress: 0,
            message: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Partial update applied to a [`StageState`] under the store's transaction.
#[derive(Debug, Clone, Default)]
pub struct StageStateDelta {
    pub status: Option<StageRunStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
}

impl StageState {
    /// Merge a partial update. A transition into `processing` starts a fresh
    /// run (new `started_at`, cleared `finished_at`); a terminal transition
    /// stamps `finished_at`.
    pub fn apply(&mut self, delta: &StageStateDelta, now: DateTime<Utc>) {
        if let Some(status) = delta.status {
            if status == StageRunStatus::Processing && self.status != StageRunStatus::Processing {
                self.started_at = Some(now);
                self.finished_at = None;
            }
            if status.is_terminal() {
                self.finished_at = Some(now);
            }
            self.status = status;
        }
        if let Some(progress) = delta.progress {
            self.progress = progress.min(100);
        }
        if let Some(message) = &delta.message {
            self.message = Some(message.clone());
        }
    }
}

/// Per-language map of stage states.
pub type StageStatusMap = HashMap<Stage, StageState>;

/// Export options. Kept structured so the export worker request carries them
/// verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub container: String,
    pub keep_original_audio: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            container: "mp4".to_string(),
            keep_original_audio: false,
        }
    }
}

/// Structured task configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Canonical target language tags.
    pub target_languages: Vec<String>,
    /// Diarized speaker label -> reference voice name.
    pub speaker_voice_mapping: HashMap<String, String>,
    pub export: ExportOptions,
}

/// One dubbing task: an uploaded video plus its downstream artifacts for all
/// requested target languages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub video_original_name: String,
    pub video_stored_name: String,
    pub source_subtitle_present: bool,
    pub overall_status: OverallStatus,
    pub config: TaskConfig,
    /// Language tag -> stage states. The reserved `default` tag holds
    /// task-global stages.
    pub language_status: HashMap<String, StageStatusMap>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derive the overall status from the stage map. Precedence: failed, then
/// processing, then completed, else pending.
pub fn derive_overall_status(
    language_status: &HashMap<String, StageStatusMap>,
    config: &TaskConfig,
) -> OverallStatus {
    let states = language_status.values().flat_map(|m| m.values());
    let mut any_failed = false;
    let mut any_processing = false;
    for state in states {
        match state.status {
            StageRunStatus::Failed => any_failed = true,
            StageRunStatus::Processing => any_processing = true,
            _ => {}
        }
    }
    if any_failed {
        return OverallStatus::Failed;
    }
    if any_processing {
        return OverallStatus::Processing;
    }

    let completed = |lang: &str, stage: Stage| {
        language_status
            .get(lang)
            .and_then(|m| m.get(&stage))
            .map(|s| s.status == StageRunStatus::Completed)
            .unwrap_or(false)
    };

    if !config.target_languages.is_empty()
        && completed(crate::DEFAULT_LANG, Stage::SpeakerDiarization)
        && config.target_languages.iter().all(|lang| {
            Stage::language_chain()
                .iter()
                .all(|stage| completed(lang, *stage))
        })
    {
        return OverallStatus::Completed;
    }

    OverallStatus::Pending
}

/// Append-only audit row written by the progress bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub task_id: TaskId,
    pub language: String,
    pub stage: Stage,
    pub status: StageRunStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}
