//! WebSocket push channel for per-task progress.
//!
//! The server pushes JSON events (`progress_update`, `batch_state`); client
//! messages are heartbeat-only and ignored. The channel closes when the
//! client disconnects, when the subscriber falls too far behind, or when the
//! task is deleted.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::StreamExt;
use tracing::{debug, info};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::parse_task_id;
use dubflow_scheduler::Subscription;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    // Reject before the upgrade if the task is unknown.
    state.store.get(task_id).await?;
    let subscription = state.registry.subscribe(task_id);
    info!(%task_id, "push subscriber connected");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription)))
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if futures::SinkExt::send(&mut sender, Message::Text(text.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    // Sink closed: task deleted or subscriber dropped.
                    None => {
                        let _ = futures::SinkExt::send(&mut sender, Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Heartbeats and client chatter are ignored.
                    Some(Ok(other)) => debug!(?other, "ignoring client message"),
                }
            }
        }
    }
    debug!("push subscriber disconnected");
}
