//! API routes.

pub mod batch;
pub mod health;
pub mod stages;
pub mod tasks;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;

use crate::AppState;
use crate::error::ApiError;
use crate::ws::ws_handler;
use dubflow_core::{Error, TaskId};

/// Uploaded videos can be large; the default 2 MiB body cap does not apply.
const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024 * 1024;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/tasks", tasks::router().merge(stages::router()))
        .nest("/api", batch::router())
        .route("/ws/tasks/{task_id}", get(ws_handler))
        .merge(health::router())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub(crate) fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(Error::InvalidInput(format!("malformed task id {raw:?}"))))
}
