//! Task lifecycle endpoints: upload, list, inspect, delete.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;
use crate::media::probe_video;
use crate::routes::parse_task_id;
use dubflow_core::subtitle::{format_timestamp, parse_srt};
use dubflow_core::task::{ProcessingLogEntry, Task};
use dubflow_core::{Error, Stage, TaskId, language};
use dubflow_db::NewTask;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/{task_id}", get(get_task).delete(delete_task))
        .route("/{task_id}/video-info", get(video_info))
        .route("/{task_id}/subtitle", get(get_subtitle).post(upload_subtitle))
        .route("/{task_id}/logs", get(get_logs))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    offset: Option<i64>,
    limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let offset = query.offset.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let tasks = state.store.list(offset, limit).await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let mut video: Option<(String, Vec<u8>)> = None;
    let mut subtitle: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::InvalidInput(e.to_string())))?
    {
        match field.name() {
            Some("video") => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "video.mp4".to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(Error::InvalidInput(e.to_string())))?;
                video = Some((name, data.to_vec()));
            }
            Some("subtitle") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(Error::InvalidInput(e.to_string())))?;
                subtitle = Some(data.to_vec());
            }
            _ => {}
        }
    }

    let (original_name, video_bytes) = video.ok_or_else(|| {
        ApiError(Error::InvalidInput("missing required `video` file".to_string()))
    })?;
    let subtitle_text = match subtitle {
        Some(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            parse_srt(&text)?;
            Some(text)
        }
        None => None,
    };

    let task_id = TaskId::new();
    let paths = state.paths.task(task_id);
    paths.ensure_layout().await.map_err(ApiError)?;

    let stored_name = paths.stored_video_name(&original_name);
    tokio::fs::write(paths.stored_video(&stored_name), &video_bytes)
        .await
        .map_err(|e| ApiError(e.into()))?;
    if let Some(text) = &subtitle_text {
        tokio::fs::write(paths.source_subtitle(), text)
            .await
            .map_err(|e| ApiError(e.into()))?;
    }

    let task = match state
        .store
        .create(NewTask {
            task_id,
            video_original_name: original_name,
            video_stored_name: stored_name,
            source_subtitle_present: subtitle_text.is_some(),
        })
        .await
    {
        Ok(task) => task,
        Err(err) => {
            paths.delete_tree().await;
            return Err(err.into());
        }
    };

    info!(%task_id, video = %task.video_original_name, "task created");
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(state.store.get(task_id).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    state.store.delete(task_id).await?;
    state.paths.task(task_id).delete_tree().await;
    state.registry.drop_all(task_id);
    info!(%task_id, "task deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn video_info(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<crate::media::VideoInfo>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let task = state.store.get(task_id).await?;
    let path = state.paths.task(task_id).stored_video(&task.video_stored_name);
    Ok(Json(probe_video(&path).await?))
}

async fn get_subtitle(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let task = state.store.get(task_id).await?;
    if !task.source_subtitle_present {
        return Err(ApiError(Error::NotFound(
            "task has no source subtitle".to_string(),
        )));
    }

    let path = state.paths.task(task_id).source_subtitle();
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ApiError(Error::NotFound("source subtitle file missing".to_string())))?;
    let lines = parse_srt(&text)?;

    let subtitles: Vec<Value> = lines
        .iter()
        .map(|line| {
            json!({
                "start_time": line.start_time,
                "end_time": line.end_time,
                "start_time_formatted": format_timestamp(line.start_time),
                "end_time_formatted": format_timestamp(line.end_time),
                "text": line.text,
            })
        })
        .collect();
    Ok(Json(json!({
        "subtitles": subtitles,
        "filename": "source_subtitle.srt",
    })))
}

async fn upload_subtitle(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Task>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    state.store.get(task_id).await?;

    let mut subtitle: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::InvalidInput(e.to_string())))?
    {
        if matches!(field.name(), Some("subtitle")) || field.file_name().is_some() {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError(Error::InvalidInput(e.to_string())))?;
            subtitle = Some(data.to_vec());
            break;
        }
    }
    let bytes = subtitle.ok_or_else(|| {
        ApiError(Error::InvalidInput("missing `subtitle` file".to_string()))
    })?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    parse_srt(&text)?;

    let paths = state.paths.task(task_id);
    paths.ensure_layout().await.map_err(ApiError)?;
    tokio::fs::write(paths.source_subtitle(), &text)
        .await
        .map_err(|e| ApiError(e.into()))?;

    let task = state.store.set_subtitle_present(task_id, true).await?;
    info!(%task_id, "subtitle uploaded");
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    language: Option<String>,
    stage: Option<String>,
    limit: Option<i64>,
}

async fn get_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<ProcessingLogEntry>>, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    state.store.get(task_id).await?;

    let language = query.language.map(|l| language::canonicalize(&l));
    let stage = match &query.stage {
        Some(raw) => Some(Stage::parse(raw).ok_or_else(|| {
            ApiError(Error::InvalidInput(format!("unknown stage {raw:?}")))
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(500).clamp(1, 5000);

    let logs = state
        .store
        .get_logs(task_id, language.as_deref(), stage, limit)
        .await?;
    Ok(Json(logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use sqlx::sqlite::SqlitePoolOptions;
    use tower::ServiceExt;

    const BOUNDARY: &str = "dubflow-test-boundary";

    const SAMPLE_SRT: &str = "1\n00:00:01,000 --> 00:00:03,500\nHello there.\n\n2\n00:00:04,000 --> 00:00:06,250\nSecond line.\n";

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

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_and_list_round_trip() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state.clone());

        let response = app
            .clone()
            .oneshot(upload_request(
                "/api/tasks/",
                &[("video", Some("demo.mp4"), b"fake-video-bytes")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task = json_body(response).await;
        assert_eq!(task["video_original_name"], "demo.mp4");
        assert_eq!(task["overall_status"], "pending");
        assert_eq!(task["language_status"], json!({}));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/tasks/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list = json_body(response).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["task_id"], task["task_id"]);

        // The video landed inside the task's own tree.
        let task_id: TaskId = task["task_id"].as_str().unwrap().parse().unwrap();
        let paths = state.paths.task(task_id);
        let stored = paths.stored_video(task["video_stored_name"].as_str().unwrap());
        assert!(stored.is_file());
        assert!(paths.contains(&stored));
    }

    #[tokio::test]
    async fn missing_video_is_rejected() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state);

        let response = app
            .oneshot(upload_request(
                "/api/tasks/",
                &[("subtitle", Some("s.srt"), SAMPLE_SRT.as_bytes())],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["kind"], "invalid-input");
    }

    #[tokio::test]
    async fn subtitle_round_trips_with_formatted_times() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state);

        let response = app
            .clone()
            .oneshot(upload_request(
                "/api/tasks/",
                &[
                    ("video", Some("demo.mp4"), b"bytes"),
                    ("subtitle", Some("demo.srt"), SAMPLE_SRT.as_bytes()),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task = json_body(response).await;
        assert_eq!(task["source_subtitle_present"], true);

        let uri = format!("/api/tasks/{}/subtitle", task["task_id"].as_str().unwrap());
        let response = app
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let subtitles = body["subtitles"].as_array().unwrap();
        assert_eq!(subtitles.len(), 2);
        assert_eq!(subtitles[0]["text"], "Hello there.");
        assert_eq!(subtitles[0]["start_time_formatted"], "00:00:01,000");
        assert_eq!(subtitles[1]["end_time_formatted"], "00:00:06,250");
    }

    #[tokio::test]
    async fn delete_cascades_to_files_and_subscribers() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state.clone());

        let response = app
            .clone()
            .oneshot(upload_request(
                "/api/tasks/",
                &[("video", Some("demo.mp4"), b"bytes")],
            ))
            .await
            .unwrap();
        let task = json_body(response).await;
        let task_id: TaskId = task["task_id"].as_str().unwrap().parse().unwrap();
        let mut subscription = state.registry.subscribe(task_id);
        assert!(state.paths.task(task_id).root().is_dir());

        let uri = format!("/api/tasks/{task_id}");
        let response = app
            .clone()
            .oneshot(Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!state.paths.task(task_id).root().exists());
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_subtitle_upload_flips_the_flag() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state);

        let response = app
            .clone()
            .oneshot(upload_request(
                "/api/tasks/",
                &[("video", Some("demo.mp4"), b"bytes")],
            ))
            .await
            .unwrap();
        let task = json_body(response).await;
        assert_eq!(task["source_subtitle_present"], false);

        let uri = format!("/api/tasks/{}/subtitle", task["task_id"].as_str().unwrap());
        let response = app
            .clone()
            .oneshot(upload_request(
                &uri,
                &[("subtitle", Some("late.srt"), SAMPLE_SRT.as_bytes())],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated = json_body(response).await;
        assert_eq!(updated["source_subtitle_present"], true);
    }

    #[tokio::test]
    async fn malformed_subtitle_is_rejected() {
        let (_tmp, state) = test_state().await;
        let app = crate::routes::router(state);

        let response = app
            .oneshot(upload_request(
                "/api/tasks/",
                &[
                    ("video", Some("demo.mp4"), b"bytes"),
                    ("subtitle", Some("bad.srt"), b"this is not an srt"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
