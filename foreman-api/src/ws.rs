//! WebSocket fan-out for board events.
//!
//! `GET /api/v1/board/{project_id}/ws` upgrades to a WebSocket fed by the
//! project's `BoardBus` channel. The connection is read-mostly: client
//! frames are ignored except close and ping.

use crate::error::ApiResult;
use crate::events::{BoardBus, BoardEvent};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use foreman_core::ProjectId;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// WebSocket upgrade handler.
pub async fn board_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Response> {
    info!(project_id = %project_id, "Board WebSocket connection request");
    let bus = state.bus.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, bus, project_id)))
}

async fn handle_socket(socket: WebSocket, bus: Arc<BoardBus>, project_id: ProjectId) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = bus.subscribe(project_id);

    // Reader side: only close frames matter.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            project_id = %project_id,
                            skipped,
                            "Board subscriber lagged; sending refresh"
                        );
                        let refresh = BoardEvent::Refresh { ts: Utc::now() };
                        if send_event(&mut sender, &refresh).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = &mut recv_task => {
                debug!(project_id = %project_id, "Board WebSocket client closed");
                break;
            }
        }
    }

    info!(project_id = %project_id, "Board WebSocket disconnected");
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &BoardEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}
