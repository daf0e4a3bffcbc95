//! Batch control and running-task endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::parse_task_id;
use dubflow_core::{Error, language};
use dubflow_scheduler::{BatchSnapshot, BatchTaskRequest};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/batch/start/{task_id}", post(start_batch))
        .route("/batch/stop", post(stop_batch))
        .route("/batch/status", get(batch_status))
        .route("/global-running-task", get(global_running_task))
        .route("/running-tasks", get(running_tasks))
}

#[derive(Debug, Deserialize)]
struct StartBatchBody {
    languages: Vec<String>,
    #[serde(default)]
    speaker_voice_mapping: HashMap<String, String>,
}

async fn start_batch(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<StartBatchBody>,
) -> Result<(StatusCode, Json<BatchSnapshot>), ApiError> {
    let task_id = parse_task_id(&task_id)?;
    state.store.get(task_id).await?;

    let languages: Vec<String> = body
        .languages
        .iter()
        .map(|l| language::canonicalize(l))
        .collect();
    if languages.is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "batch requires at least one target language".to_string(),
        )));
    }

    state.store.set_target_languages(task_id, languages.clone()).await?;
    if !body.speaker_voice_mapping.is_empty() {
        state
            .store
            .merge_speaker_voice_mapping(task_id, body.speaker_voice_mapping)
            .await?;
    }

    state.batch.start(vec![BatchTaskRequest { task_id, languages }])?;
    Ok((StatusCode::ACCEPTED, Json(state.batch.status())))
}

async fn stop_batch(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BatchSnapshot>), ApiError> {
    state.batch.stop()?;
    Ok((StatusCode::ACCEPTED, Json(state.batch.status())))
}

async fn batch_status(State(state): State<AppState>) -> Json<BatchSnapshot> {
    Json(state.batch.status())
}

async fn global_running_task(State(state): State<AppState>) -> Json<Value> {
    let current = state.lock.current();
    Json(json!({
        "running": current.is_some(),
        "record": current,
    }))
}

async fn running_tasks(State(state): State<AppState>) -> Json<Value> {
    let map: HashMap<String, _> = state
        .lock
        .running_map()
        .into_iter()
        .map(|(task_id, record)| (task_id.to_string(), record))
        .collect();
    Json(json!(map))
}
