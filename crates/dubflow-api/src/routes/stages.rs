//! Stage trigger and status endpoints.
//!
//! Triggers are fire-and-forget: they validate, admit the run, and return
//! 202. Outcome is observed over the push channel or the status endpoints.

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
use dubflow_core::task::StageState;
use dubflow_core::{DEFAULT_LANG, Stage, TaskId, language};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{task_id}/speaker-diarization", post(trigger_diarization))
        .route("/{task_id}/speaker-diarization/status", get(diarization_status))
        .route("/{task_id}/languages/{language}/translate", post(trigger_translate))
        .route(
            "/{task_id}/languages/{language}/translate/status",
            get(translate_status),
        )
        .route(
            "/{task_id}/languages/{language}/voice-cloning",
            post(trigger_voice_cloning),
        )
        .route(
            "/{task_id}/languages/{language}/voice-cloning/status",
            get(voice_cloning_status),
        )
        .route("/{task_id}/languages/{language}/stitch-audio", post(trigger_stitch))
        .route(
            "/{task_id}/languages/{language}/stitch-audio/status",
            get(stitch_status),
        )
        .route("/{task_id}/languages/{language}/export-video", post(trigger_export))
        .route(
            "/{task_id}/languages/{language}/export-video/status",
            get(export_status),
        )
}

/// Shared trigger path: resolve the task, canonicalize the language, admit.
async fn trigger(
    state: &AppState,
    raw_task_id: &str,
    raw_language: &str,
    stage: Stage,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task_id = parse_task_id(raw_task_id)?;
    state.store.get(task_id).await?;
    let language = language::canonicalize(raw_language);

    state.runner.trigger(task_id, language.clone(), stage)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "task_id": task_id,
            "language": language,
            "stage": stage,
        })),
    ))
}

async fn stage_state(
    state: &AppState,
    raw_task_id: &str,
    raw_language: &str,
    stage: Stage,
) -> Result<(TaskId, StageState), ApiError> {
    let task_id = parse_task_id(raw_task_id)?;
    let task = state.store.get(task_id).await?;
    let language = language::canonicalize(raw_language);
    let stage_state = task
        .language_status
        .get(&language)
        .and_then(|stages| stages.get(&stage))
        .cloned()
        .unwrap_or_default();
    Ok((task_id, stage_state))
}

async fn trigger_diarization(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    trigger(&state, &task_id, DEFAULT_LANG, Stage::SpeakerDiarization).await
}

/// Status block of the diarization stage, with the persisted speaker data
/// merged in once the stage has produced it. Status itself always comes from
/// the store, never from file existence.
async fn diarization_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (task_id, stage_state) =
        stage_state(&state, &task_id, DEFAULT_LANG, Stage::SpeakerDiarization).await?;

    let mut body = match serde_json::to_value(&stage_state) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let speaker_data_path = state.paths.task(task_id).speaker_data();
    if let Ok(bytes) = tokio::fs::read(&speaker_data_path).await {
        if let Ok(Value::Object(data)) = serde_json::from_slice::<Value>(&bytes) {
            body.extend(data);
        }
    }
    Ok(Json(Value::Object(body)))
}

async fn trigger_translate(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    trigger(&state, &task_id, &language, Stage::Translation).await
}

async fn translate_status(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<Json<StageState>, ApiError> {
    let (_, stage_state) = stage_state(&state, &task_id, &language, Stage::Translation).await?;
    Ok(Json(stage_state))
}

#[derive(Debug, Default, Deserialize)]
struct VoiceCloningBody {
    #[serde(default)]
    speaker_voice_mapping: HashMap<String, String>,
}

async fn trigger_voice_cloning(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
    body: Option<Json<VoiceCloningBody>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mapping = body.map(|Json(b)| b.speaker_voice_mapping).unwrap_or_default();
    if !mapping.is_empty() {
        let id = parse_task_id(&task_id)?;
        state.store.merge_speaker_voice_mapping(id, mapping).await?;
    }
    trigger(&state, &task_id, &language, Stage::VoiceCloning).await
}

async fn voice_cloning_status(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<Json<StageState>, ApiError> {
    let (_, stage_state) = stage_state(&state, &task_id, &language, Stage::VoiceCloning).await?;
    Ok(Json(stage_state))
}

async fn trigger_stitch(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    trigger(&state, &task_id, &language, Stage::Stitch).await
}

async fn stitch_status(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<Json<StageState>, ApiError> {
    let (_, stage_state) = stage_state(&state, &task_id, &language, Stage::Stitch).await?;
    Ok(Json(stage_state))
}

async fn trigger_export(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    trigger(&state, &task_id, &language, Stage::Export).await
}

async fn export_status(
    State(state): State<AppState>,
    Path((task_id, language)): Path<(String, String)>,
) -> Result<Json<StageState>, ApiError> {
    let (_, stage_state) = stage_state(&state, &task_id, &language, Stage::Export).await?;
    Ok(Json(stage_state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        dubflow_db::run_migrations(&pool).await.unwrap();
        let state = AppState::new(
            pool,
            tmp.path().to_path_buf(),
            dubflow_config::RuntimeProfiles::default(),
        );
        (tmp, state)
    }

    async fn seeded_task(state: &AppState) -> TaskId {
        let task_id = TaskId::new();
        let paths = state.paths.task(task_id);
        paths.ensure_layout().await.unwrap();
        tokio::fs::write(
            paths.source_subtitle(),
            "1\n00:00:01,000 --> 00:00:02,000\nHello.\n",
        )
        .await
        .unwrap();
        state
            .store
            .create(dubflow_db::NewTask {
                task_id,
                video_original_name: "demo.mp4".to_string(),
                video_stored_name: paths.stored_video_name("demo.mp4"),
                source_subtitle_present: true,
            })
            .await
            .unwrap();
        task_id
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn trigger_returns_202_and_canonicalizes_the_language() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state.clone());
        let task_id = seeded_task(&state).await;

        // Natural-language name at the boundary; tag everywhere else.
        let uri = format!("/api/tasks/{task_id}/languages/%E8%8B%B1%E8%AF%AD/translate");
        let response = app.oneshot(post(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["language"], "en");

        // The background run starts (and fails: no worker profile), but the
        // persisted state is keyed by the canonical tag.
        for _ in 0..100 {
            let task = state.store.get(task_id).await.unwrap();
            if task.language_status.contains_key("en") {
                assert!(!task.language_status.keys().any(|k| k == "英语"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stage state never appeared");
    }

    #[tokio::test]
    async fn trigger_on_unknown_task_is_404() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state);

        let uri = format!("/api/tasks/{}/speaker-diarization", TaskId::new());
        let response = app.oneshot(post(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_defaults_to_idle_before_any_run() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state.clone());
        let task_id = seeded_task(&state).await;

        let uri = format!("/api/tasks/{task_id}/languages/en/translate/status");
        let response = app.oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "idle");
        assert_eq!(body["progress"], 0);
    }

    #[tokio::test]
    async fn voice_cloning_body_merges_the_mapping() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state.clone());
        let task_id = seeded_task(&state).await;

        let uri = format!("/api/tasks/{task_id}/languages/en/voice-cloning");
        let request = Request::builder()
            .method("POST")
            .uri(&uri)
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({"speaker_voice_mapping": {"男1": "voice_a"}})).unwrap(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let task = state.store.get(task_id).await.unwrap();
        assert_eq!(
            task.config.speaker_voice_mapping.get("男1").map(String::as_str),
            Some("voice_a")
        );
    }
}
