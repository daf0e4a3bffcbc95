//! The global run lock.
//!
//! Workers are heavyweight and share one GPU; running two at once trips
//! memory-exhaustion failures across the pipeline, so the whole process
//! admits at most one stage execution at a time. Short operations (CRUD,
//! log appends, subscriptions) never pass through here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use dubflow_core::worker::CancelToken;
use dubflow_core::{Error, Result, Stage, TaskId};

/// Snapshot of the single currently executing stage.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub language: String,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub latest_progress: u8,
    pub latest_message: Option<String>,
}

type RunKey = (TaskId, String, Stage);

struct CurrentRun {
    record: ExecutionRecord,
    cancel: CancelToken,
}

type CurrentSlot = Arc<Mutex<Option<CurrentRun>>>;
type AdmittedSet = Arc<Mutex<HashSet<RunKey>>>;

/// Process-wide serialization of stage execution.
pub struct GlobalRunLock {
    slot: Arc<tokio::sync::Mutex<()>>,
    current: CurrentSlot,
    /// Every admitted (pending or running) run key. Guards duplicate
    /// triggers; distinct keys queue on `slot` instead.
    admitted: AdmittedSet,
}

impl GlobalRunLock {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(tokio::sync::Mutex::new(())),
            current: Arc::new(Mutex::new(None)),
            admitted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register intent to run one `(task, language, stage)`. Fails fast with
    /// a conflict when the same key is already pending or running.
    pub fn admit(&self, task_id: TaskId, language: &str, stage: Stage) -> Result<Admission> {
        let key = (task_id, language.to_string(), stage);
        let mut admitted = self.admitted.lock().unwrap_or_else(|e| e.into_inner());
        if !admitted.insert(key.clone()) {
            return Err(Error::Conflict(format!(
                "{stage} for {language} of task {task_id} is already running or queued"
            )));
        }
        Ok(Admission {
            admitted: Some(self.admitted.clone()),
            key,
        })
    }

    /// Wait for the execution slot and become the current run.
    pub async fn acquire(&self, admission: Admission, cancel: CancelToken) -> RunGuard {
        let slot = self.slot.clone().lock_owned().await;
        let record = ExecutionRecord {
            task_id: admission.key.0,
            language: admission.key.1.clone(),
            stage: admission.key.2,
            started_at: Utc::now(),
            latest_progress: 0,
            latest_message: None,
        };
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(CurrentRun { record, cancel });
        RunGuard {
            current: self.current.clone(),
            admission,
            _slot: slot,
        }
    }

    /// The currently executing stage, if any.
    pub fn current(&self) -> Option<ExecutionRecord> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|run| run.record.clone())
    }

    /// task_id -> execution record. At most one entry under single-flight.
    pub fn running_map(&self) -> HashMap<TaskId, ExecutionRecord> {
        self.current()
            .map(|record| HashMap::from([(record.task_id, record)]))
            .unwrap_or_default()
    }

    /// Fold a progress observation into the current record.
    pub fn note_progress(
        &self,
        task_id: TaskId,
        language: &str,
        stage: Stage,
        progress: u8,
        message: Option<&str>,
    ) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = current.as_mut() {
            if run.record.task_id == task_id
                && run.record.language == language
                && run.record.stage == stage
            {
                run.record.latest_progress = progress;
                if let Some(message) = message {
                    run.record.latest_message = Some(message.to_string());
                }
            }
        }
    }

    /// Clear the current record if it matches. Called by the progress bus on
    /// terminal transitions; the run guard clears again on drop, harmlessly.
    pub fn clear_for(&self, task_id: TaskId, language: &str, stage: Stage) {
        clear_matching(&self.current, task_id, language, stage);
    }

    /// Trip the current run's cancel token. Returns whether a run was live.
    pub fn cancel_current(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for GlobalRunLock {
    fn default() -> Self {
        Self::new()
    }
}

fn clear_matching(current: &CurrentSlot, task_id: TaskId, language: &str, stage: Stage) {
    let mut current = current.lock().unwrap_or_else(|e| e.into_inner());
    if current.as_ref().is_some_and(|run| {
        run.record.task_id == task_id
            && run.record.language == language
            && run.record.stage == stage
    }) {
        *current = None;
    }
}

/// Admission ticket for one run key. Dropping it (before or after the run)
/// releases the duplicate-trigger guard.
pub struct Admission {
    admitted: Option<AdmittedSet>,
    key: RunKey,
}

impl Admission {
    pub fn key(&self) -> (TaskId, String, Stage) {
        self.key.clone()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(admitted) = self.admitted.take() {
            admitted
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.key);
        }
    }
}

/// Holds the execution slot. Dropping releases the slot, the admission key,
/// and the current record on every exit path, panics included.
pub struct RunGuard {
    current: CurrentSlot,
    admission: Admission,
    _slot: OwnedMutexGuard<()>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let (task_id, language, stage) = self.admission.key();
        clear_matching(&self.current, task_id, &language, stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_admission_conflicts_until_released() {
        let lock = Arc::new(GlobalRunLock::new());
        let task = TaskId::new();

        let first = lock.admit(task, "en", Stage::Translation).unwrap();
        assert!(matches!(
            lock.admit(task, "en", Stage::Translation),
            Err(Error::Conflict(_))
        ));
        // A different key is admissible immediately.
        let _other = lock.admit(task, "ko", Stage::Translation).unwrap();

        drop(first);
        lock.admit(task, "en", Stage::Translation).unwrap();
    }

    #[tokio::test]
    async fn runs_never_overlap() {
        let lock = Arc::new(GlobalRunLock::new());
        let live = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for language in ["en", "ko", "ja"] {
            let lock = lock.clone();
            let live = live.clone();
            let task = TaskId::new();
            handles.push(tokio::spawn(async move {
                let admission = lock.admit(task, language, Stage::Translation).unwrap();
                let guard = lock.acquire(admission, CancelToken::new()).await;
                assert_eq!(live.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(live.fetch_sub(1, Ordering::SeqCst), 1);
                drop(guard);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn guard_drop_clears_current_and_key() {
        let lock = GlobalRunLock::new();
        let task = TaskId::new();

        let admission = lock.admit(task, "en", Stage::Stitch).unwrap();
        let guard = lock.acquire(admission, CancelToken::new()).await;
        let record = lock.current().unwrap();
        assert_eq!(record.task_id, task);
        assert_eq!(record.stage, Stage::Stitch);
        assert_eq!(lock.running_map().len(), 1);

        drop(guard);
        assert!(lock.current().is_none());
        assert!(lock.running_map().is_empty());
        lock.admit(task, "en", Stage::Stitch).unwrap();
    }

    #[tokio::test]
    async fn cancel_current_trips_the_token() {
        let lock = GlobalRunLock::new();
        assert!(!lock.cancel_current());

        let admission = lock.admit(TaskId::new(), "en", Stage::Export).unwrap();
        let cancel = CancelToken::new();
        let _guard = lock.acquire(admission, cancel.clone()).await;

        assert!(lock.cancel_current());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn note_progress_updates_matching_record_only() {
        let lock = GlobalRunLock::new();
        let task = TaskId::new();
        let admission = lock.admit(task, "en", Stage::Translation).unwrap();
        let _guard = lock.acquire(admission, CancelToken::new()).await;

        lock.note_progress(task, "en", Stage::Translation, 40, Some("halfway"));
        lock.note_progress(task, "ko", Stage::Translation, 90, Some("other"));

        let record = lock.current().unwrap();
        assert_eq!(record.latest_progress, 40);
        assert_eq!(record.latest_message.as_deref(), Some("halfway"));
    }
}
