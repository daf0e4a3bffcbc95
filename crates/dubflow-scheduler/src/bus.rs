//! The progress bus.
//!
//! Single entry point for every stage status change, whether it comes from
//! the stage runner or straight from worker output. Ordering is load-bearing:
//! the durable write commits first, then the audit log, then the in-memory
//! run record, and only then the fan-out — a subscriber can never observe a
//! state the store has not already committed.

use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::lock::GlobalRunLock;
use crate::subscribers::{SubscriberRegistry, TaskEvent};
use dubflow_core::task::{ProcessingLogEntry, StageRunStatus, StageStateDelta, Task};
use dubflow_core::{Result, Stage, TaskId};
use dubflow_db::TaskStore;

pub struct ProgressBus {
    store: Arc<dyn TaskStore>,
    registry: Arc<SubscriberRegistry>,
    lock: Arc<GlobalRunLock>,
}

impl ProgressBus {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<SubscriberRegistry>,
        lock: Arc<GlobalRunLock>,
    ) -> Self {
        Self {
            store,
            registry,
            lock,
        }
    }

    /// Publish one stage status change. Returns the merged task state after
    /// the durable write. Log-append and fan-out failures never roll the
    /// write back; a write failure propagates to the caller.
    pub async fn publish(
        &self,
        task_id: TaskId,
        language: &str,
        stage: Stage,
        status: StageRunStatus,
        progress: u8,
        message: Option<String>,
    ) -> Result<Task> {
        let task = self
            .store
            .update_stage_status(
                task_id,
                language,
                stage,
                StageStateDelta {
                    status: Some(status),
                    progress: Some(progress),
                    message: message.clone(),
                },
            )
            .await?;

        if let Err(err) = self
            .store
            .append_log(ProcessingLogEntry {
                task_id,
                language: language.to_string(),
                stage,
                status,
                progress,
                message: message.clone(),
                timestamp: Utc::now(),
            })
            .await
        {
            warn!(%task_id, %stage, error = %err, "processing log append failed");
        }

        if status.is_terminal() {
            self.lock.clear_for(task_id, language, stage);
        } else {
            self.lock
                .note_progress(task_id, language, stage, progress, message.as_deref());
        }

        self.registry.broadcast(
            task_id,
            &TaskEvent::ProgressUpdate {
                task_id,
                language: language.to_string(),
                stage,
                status,
                progress,
                message,
            },
        );

        Ok(task)
    }
}
