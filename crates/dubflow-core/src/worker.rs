//! External worker contract.
//!
//! Workers are out-of-process programs doing the heavy lifting of one stage.
//! The contract is file-based: the adapter writes a JSON request document and
//! passes its path as the sole argument; the worker streams progress lines on
//! its standard streams and prints a final JSON result on stdout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::{Result, Stage, TaskId};

/// Cooperative cancellation handle shared between the run lock's current
/// record and the worker adapter.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Sender gone without a cancel: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One progress observation relayed from a worker's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerProgress {
    /// Percent complete, if the line carried a `<current>/<total>` shape.
    pub percent: Option<u8>,
    /// Human-readable event text, if any.
    pub message: Option<String>,
}

/// One invocation of an external worker.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub task_id: TaskId,
    pub language: String,
    pub stage: Stage,
    /// Where the request document is written before spawning.
    pub request_path: PathBuf,
    /// The request document itself.
    pub request: serde_json::Value,
    /// Wall-clock limit for the whole invocation.
    pub timeout: Duration,
}

/// Built-in wall-clock limits; profiles may override.
pub fn default_timeout(stage: Stage) -> Duration {
    match stage {
        Stage::Translation => Duration::from_secs(600),
        Stage::VoiceCloning => Duration::from_secs(1800),
        _ => Duration::from_secs(600),
    }
}

/// Invokes one external processing program and relays its progress and
/// result. Implementations must honor `cancel` and `job.timeout`.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the worker to completion, forwarding progress observations.
    /// Returns the worker's final JSON document.
    async fn invoke(
        &self,
        job: WorkerJob,
        progress: mpsc::Sender<WorkerProgress>,
        cancel: CancelToken,
    ) -> Result<serde_json::Value>;
}

// --- Stage request documents -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizationRequest {
    pub task_id: TaskId,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub subtitle_path: PathBuf,
    pub segments_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationLineTask {
    pub task_id: String,
    pub source: String,
    pub target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub tasks: Vec<TranslationLineTask>,
    pub model_path: Option<PathBuf>,
    pub num_processes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloningLineTask {
    pub segment_index: usize,
    /// Diarized speaker label; the worker resolves it to a reference voice.
    pub speaker_name: String,
    pub reference: Option<String>,
    pub target_text: String,
    pub output_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloningRequest {
    pub model_dir: Option<PathBuf>,
    pub tasks: Vec<CloningLineTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchRequest {
    pub language: String,
    pub segments_dir: PathBuf,
    pub subtitle_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub language: String,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub output_path: PathBuf,
    pub container: String,
    pub keep_original_audio: bool,
}

// --- Stage response documents ------------------------------------------------

/// Diarization result; the runner persists this to `processed/speaker_data.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizationOutput {
    /// Numeric speaker id per source subtitle line.
    pub speaker_labels: Vec<i64>,
    /// Numeric id -> human label (e.g. "男1", "女2").
    pub speaker_name_mapping: HashMap<String, String>,
    /// Numeric id -> detected gender.
    pub gender_dict: HashMap<String, String>,
    pub unique_speakers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationLineResult {
    pub task_id: String,
    pub source: String,
    pub translation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloningLineResult {
    pub segment_index: usize,
    pub status: String,
    pub output_file: PathBuf,
    pub inference_time: Option<f64>,
}

/// Re-planned timeline entry reported by the stitcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchedSegment {
    pub index: usize,
    pub actual_start_time: f64,
    pub actual_end_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchOutput {
    pub output_path: PathBuf,
    pub segments: Vec<StitchedSegment>,
}
