use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::{ApiError, ApiPath, AppState};
use super::auth::AuthUser;
use crate::reasoning::step::StepType;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const CHANNEL_CAPACITY: usize = 256;

// ── Notification types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepNotification {
    pub id: i64,
    pub step_number: i64,
    pub step_type: StepType,
    pub status: StepStatus,
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ToolExecuted {
        tool_name: String,
        result: serde_json::Value,
    },
    ReasoningStep {
        session_id: i64,
        step: StepNotification,
    },
}

// ── Per-project broadcast groups ─────────────────────────────────────

/// Fan-out of notifications to the sockets watching each project.
#[derive(Default)]
pub struct Notifier {
    channels: Mutex<HashMap<i64, broadcast::Sender<String>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<i64, broadcast::Sender<String>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, project_id: i64) -> broadcast::Receiver<String> {
        self.channels()
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Serialize and send to every socket watching `project_id`. Does
    /// nothing when nobody is listening.
    pub fn publish(&self, project_id: i64, msg: &Notification) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize notification");
                return;
            }
        };
        let mut channels = self.channels();
        if let Some(tx) = channels.get(&project_id) {
            if tx.send(json).is_err() {
                // Every receiver is gone.
                channels.remove(&project_id);
            }
        }
    }

    /// Subscribe a socket to `project_id`. The project's channel is removed
    /// when its last socket subscription is dropped.
    pub fn watch(self: &Arc<Self>, project_id: i64) -> Subscription {
        Subscription {
            project_id,
            rx: self.subscribe(project_id),
            notifier: self.clone(),
        }
    }

    /// Drop the channel of `project_id` if the caller holds its only receiver.
    fn release(&self, project_id: i64) {
        let mut channels = self.channels();
        if channels
            .get(&project_id)
            .is_some_and(|tx| tx.receiver_count() <= 1)
        {
            channels.remove(&project_id);
        }
    }

    pub fn tool_executed(&self, project_id: i64, tool_name: &str, result: &serde_json::Value) {
        self.publish(
            project_id,
            &Notification::ToolExecuted {
                tool_name: tool_name.to_string(),
                result: result.clone(),
            },
        );
    }
}

/// A socket's receiver for one project's notifications.
pub struct Subscription {
    project_id: i64,
    rx: broadcast::Receiver<String>,
    notifier: Arc<Notifier>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.release(self.project_id);
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    AuthUser(user): AuthUser,
    ApiPath(project_id): ApiPath<i64>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id;
    let project = state
        .db
        .call(move |db| db.get_project(project_id, user_id))
        .await?;
    if project.is_none() {
        return Err(ApiError::NotFound("Project not found".into()));
    }

    debug!(project_id, user = %user.username, "WebSocket subscriber connected");
    let subscription = state.notifier.watch(project_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription)))
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, &mut subscription.rx).await;
    debug!(project_id = subscription.project_id, "WebSocket subscriber disconnected");
}

/// Forward notifications to the client and keep the connection alive with
/// pings. The loop ends when the client closes, errors, or misses a pong for
/// longer than [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    rx: &mut broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Client messages carry nothing we act on.
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
