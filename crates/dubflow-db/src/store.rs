//! Task store: trait and SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{DbError, DbResult};
use dubflow_core::task::{
    OverallStatus, ProcessingLogEntry, StageRunStatus, StageStateDelta, StageStatusMap, Task,
    TaskConfig, derive_overall_status,
};
use dubflow_core::{Stage, TaskId};

/// Fields needed to create a task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: TaskId,
    pub video_original_name: String,
    pub video_stored_name: String,
    pub source_subtitle_present: bool,
}

/// Sole authority over durable task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, new: NewTask) -> DbResult<Task>;
    async fn get(&self, task_id: TaskId) -> DbResult<Task>;
    /// Newest first.
    async fn list(&self, offset: i64, limit: i64) -> DbResult<Vec<Task>>;
    /// Removes the row and its logs. The caller then removes the file tree.
    async fn delete(&self, task_id: TaskId) -> DbResult<()>;

    /// Apply a partial stage update under the per-task transaction: re-read,
    /// merge, recompute `overall_status`, bump `updated_at`. Returns the new
    /// full state for broadcasting.
    async fn update_stage_status(
        &self,
        task_id: TaskId,
        language: &str,
        stage: Stage,
        delta: StageStateDelta,
    ) -> DbResult<Task>;

    async fn set_subtitle_present(&self, task_id: TaskId, present: bool) -> DbResult<Task>;
    async fn set_target_languages(&self, task_id: TaskId, languages: Vec<String>)
    -> DbResult<Task>;
    async fn merge_speaker_voice_mapping(
        &self,
        task_id: TaskId,
        mapping: HashMap<String, String>,
    ) -> DbResult<Task>;

    async fn append_log(&self, entry: ProcessingLogEntry) -> DbResult<()>;
    async fn get_logs(
        &self,
        task_id: TaskId,
        language: Option<&str>,
        stage: Option<Stage>,
        limit: i64,
    ) -> DbResult<Vec<ProcessingLogEntry>>;

    /// Startup recovery: every stage still marked `processing` from a
    /// previous process becomes `failed`/"interrupted". Returns the number of
    /// relabeled stages.
    async fn recover_interrupted(&self) -> DbResult<u64>;
}

/// SQLite implementation of [`TaskStore`].
pub struct SqliteTaskStore {
    pool: SqlitePool,
    /// Serializes read-merge-write cycles per task on top of the SQL
    /// transaction.
    task_locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    fn task_lock(&self, task_id: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.task_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(task_id).or_default().clone()
    }

    fn forget_lock(&self, task_id: TaskId) {
        let mut locks = self.task_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&task_id);
    }

    async fn write_task(&self, task: &Task) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET source_subtitle_present = ?, overall_status = ?, config = ?,
                language_status = ?, last_error = ?, updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(task.source_subtitle_present)
        .bind(task.overall_status.as_str())
        .bind(encode_json(&task.config)?)
        .bind(encode_json(&task.language_status)?)
        .bind(&task.last_error)
        .bind(task.updated_at)
        .bind(task.task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Shared read-modify-write cycle for config-level mutations.
    async fn modify<F>(&self, task_id: TaskId, mutate: F) -> DbResult<Task>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut task = self.get(task_id).await?;
        mutate(&mut task);
        task.overall_status = derive_overall_status(&task.language_status, &task.config);
        task.updated_at = Utc::now();
        self.write_task(&task).await?;
        Ok(task)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    video_original_name: String,
    video_stored_name: String,
    source_subtitle_present: bool,
    overall_status: String,
    config: String,
    language_status: String,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> DbResult<Task> {
        Ok(Task {
            task_id: self
                .task_id
                .parse()
                .map_err(|_| DbError::Corrupt(format!("task_id {:?}", self.task_id)))?,
            video_original_name: self.video_original_name,
            video_stored_name: self.video_stored_name,
            source_subtitle_present: self.source_subtitle_present,
            overall_status: OverallStatus::parse(&self.overall_status)
                .ok_or_else(|| DbError::Corrupt(format!("overall_status {:?}", self.overall_status)))?,
            config: decode_json(&self.config)?,
            language_status: decode_json(&self.language_status)?,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    task_id: String,
    language: String,
    stage: String,
    status: String,
    progress: i64,
    message: Option<String>,
    timestamp: DateTime<Utc>,
}

impl LogRow {
    fn into_entry(self) -> DbResult<ProcessingLogEntry> {
        Ok(ProcessingLogEntry {
            task_id: self
                .task_id
                .parse()
                .map_err(|_| DbError::Corrupt(format!("task_id {:?}", self.task_id)))?,
            language: self.language,
            stage: Stage::parse(&self.stage)
                .ok_or_else(|| DbError::Corrupt(format!("stage {:?}", self.stage)))?,
            status: StageRunStatus::parse(&self.status)
                .ok_or_else(|| DbError::Corrupt(format!("status {:?}", self.status)))?,
            progress: self.progress.clamp(0, 100) as u8,
            message: self.message,
            timestamp: self.timestamp,
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::Corrupt(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> DbResult<T> {
    serde_json::from_str(text).map_err(|e| DbError::Corrupt(e.to_string()))
}

const TASK_COLUMNS: &str = "task_id, video_original_name, video_stored_name, \
     source_subtitle_present, overall_status, config, language_status, \
     last_error, created_at, updated_at";

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, new: NewTask) -> DbResult<Task> {
        let now = Utc::now();
        let task = Task {
            task_id: new.task_id,
            video_original_name: new.video_original_name,
            video_stored_name: new.video_stored_name,
            source_subtitle_present: new.source_subtitle_present,
            overall_status: OverallStatus::Pending,
            config: TaskConfig::default(),
            language_status: HashMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, video_original_name, video_stored_name,
                source_subtitle_present, overall_status, config, language_status,
                last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(&task.video_original_name)
        .bind(&task.video_stored_name)
        .bind(task.source_subtitle_present)
        .bind(task.overall_status.as_str())
        .bind(encode_json(&task.config)?)
        .bind(encode_json(&task.language_status)?)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(task),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|e| e.is_unique_violation()) =>
            {
                Err(DbError::Duplicate(format!("task {}", task.task_id)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, task_id: TaskId) -> DbResult<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| DbError::NotFound(format!("task {task_id}")))?
            .into_task()
    }

    async fn list(&self, offset: i64, limit: i64) -> DbResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, task_id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn delete(&self, task_id: TaskId) -> DbResult<()> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let result = sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("task {task_id}")));
        }
        sqlx::query("DELETE FROM processing_logs WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;

        drop(_guard);
        self.forget_lock(task_id);
        Ok(())
    }

    async fn update_stage_status(
        &self,
        task_id: TaskId,
        language: &str,
        stage: Stage,
        delta: StageStateDelta,
    ) -> DbResult<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
                .bind(task_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let mut task = row
            .ok_or_else(|| DbError::NotFound(format!("task {task_id}")))?
            .into_task()?;

        let now = Utc::now();
        let state = task
            .language_status
            .entry(language.to_string())
            .or_insert_with(StageStatusMap::new)
            .entry(stage)
            .or_default();
        state.apply(&delta, now);
        if delta.status == Some(StageRunStatus::Failed) {
            task.last_error = delta
                .message
                .clone()
                .or_else(|| Some(format!("{stage} failed")));
        }
        task.overall_status = derive_overall_status(&task.language_status, &task.config);
        task.updated_at = now;

        sqlx::query(
            r#"
            UPDATE tasks
            SET overall_status = ?, language_status = ?, last_error = ?, updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(task.overall_status.as_str())
        .bind(encode_json(&task.language_status)?)
        .bind(&task.last_error)
        .bind(task.updated_at)
        .bind(task.task_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(task)
    }

    async fn set_subtitle_present(&self, task_id: TaskId, present: bool) -> DbResult<Task> {
        self.modify(task_id, |task| {
            task.source_subtitle_present = present;
        })
        .await
    }

    async fn set_target_languages(
        &self,
        task_id: TaskId,
        languages: Vec<String>,
    ) -> DbResult<Task> {
        self.modify(task_id, |task| {
            task.config.target_languages = languages;
        })
        .await
    }

    async fn merge_speaker_voice_mapping(
        &self,
        task_id: TaskId,
        mapping: HashMap<String, String>,
    ) -> DbResult<Task> {
        self.modify(task_id, |task| {
            task.config.speaker_voice_mapping.extend(mapping);
        })
        .await
    }

    async fn append_log(&self, entry: ProcessingLogEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_logs (task_id, language, stage, status, progress, message, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.task_id.to_string())
        .bind(&entry.language)
        .bind(entry.stage.as_str())
        .bind(entry.status.as_str())
        .bind(entry.progress as i64)
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_logs(
        &self,
        task_id: TaskId,
        language: Option<&str>,
        stage: Option<Stage>,
        limit: i64,
    ) -> DbResult<Vec<ProcessingLogEntry>> {
        let mut sql = String::from(
            "SELECT task_id, language, stage, status, progress, message, timestamp \
             FROM processing_logs WHERE task_id = ?",
        );
        if language.is_some() {
            sql.push_str(" AND language = ?");
        }
        if stage.is_some() {
            sql.push_str(" AND stage = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, LogRow>(&sql).bind(task_id.to_string());
        if let Some(language) = language {
            query = query.bind(language.to_string());
        }
        if let Some(stage) = stage {
            query = query.bind(stage.as_str());
        }
        let rows = query.bind(limit.max(0)).fetch_all(&self.pool).await?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }

    async fn recover_interrupted(&self) -> DbResult<u64> {
        let rows: Vec<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks")).fetch_all(&self.pool).await?;

        let mut relabeled = 0u64;
        for row in rows {
            let mut task = row.into_task()?;
            let now = Utc::now();
            let mut touched = false;
            for states in task.language_status.values_mut() {
                for state in states.values_mut() {
                    if state.status == StageRunStatus::Processing {
                        state.status = StageRunStatus::Failed;
                        state.message = Some("interrupted".to_string());
                        state.finished_at = Some(now);
                        touched = true;
                        relabeled += 1;
                    }
                }
            }
            if touched {
                task.last_error = Some("interrupted".to_string());
                task.overall_status = derive_overall_status(&task.language_status, &task.config);
                task.updated_at = now;
                self.write_task(&task).await?;
            }
        }
        Ok(relabeled)
    }
}
