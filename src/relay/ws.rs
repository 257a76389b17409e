//! WebSocket gateway and chat HTTP routes
//!
//! `GET /ws?token=...` upgrades to the client protocol. Each socket is split
//! into a reader that feeds actions to the relay and a pusher that drains the
//! handle's outbound queue and sends heartbeats.

use super::engine::Relay;
use crate::auth::{bearer_token, SessionAuthenticator};
use crate::connection::{ConnectionHandle, Outbound};
use crate::error::ChatError;
use crate::protocol::{parse_action, ServerEvent, CLOSE_CODE_HEARTBEAT};
use crate::room::CloseOutcome;
use crate::types::{EventId, RoomId, UserId};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::SplitSink, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Chat server configuration
#[derive(Debug, Clone)]
pub struct ChatServerConfig {
    pub host: String,
    pub port: u16,
    /// Ping interval; a socket silent for two intervals is dropped
    pub heartbeat_interval: Duration,
    /// Bearer token for the admin routes; admin routes are disabled when unset
    pub admin_token: Option<String>,
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            heartbeat_interval: Duration::from_secs(30),
            admin_token: None,
        }
    }
}

/// Shared state of the chat routes
#[derive(Clone)]
pub struct GatewayState {
    pub relay: Arc<Relay>,
    pub authenticator: Arc<dyn SessionAuthenticator>,
    pub heartbeat_interval: Duration,
    pub admin_token: Option<String>,
}

/// Serves the WebSocket gateway and the chat HTTP routes
pub struct ChatServer {
    config: ChatServerConfig,
    state: GatewayState,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    pub fn new(
        config: ChatServerConfig,
        relay: Arc<Relay>,
        authenticator: Arc<dyn SessionAuthenticator>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = GatewayState {
            relay,
            authenticator,
            heartbeat_interval: config.heartbeat_interval,
            admin_token: config.admin_token.clone(),
        };
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind and serve until [`ChatServer::stop`] is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid chat server address")?;
        let listener = TcpListener::bind(addr).await?;
        info!("Chat gateway listening on ws://{}/ws", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Chat server shutdown signal received");
            })
            .await?;

        info!("Chat server stopped");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping chat server...");
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to chat server: {}", e);
        }
        Ok(())
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/rooms/{room_id}/events", get(backlog_handler))
        .route("/admin/rooms/{room_id}/close", post(admin_close_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct BacklogQuery {
    #[serde(default)]
    pub since: EventId,
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<ConnectQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = match state.authenticator.authenticate(&query.token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("Rejected WebSocket connection: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: GatewayState, user_id: UserId) {
    let (handle, rx) = ConnectionHandle::new(user_id.clone());
    let (sender, mut receiver) = socket.split();

    if let Err(e) = state.relay.connect(handle.clone()).await {
        error!("Failed to register connection for {}: {}", user_id, e);
        return;
    }
    info!("{} connected", user_id);

    let last_seen = Arc::new(Mutex::new(Instant::now()));
    let mut send_task = pusher_loop(rx, sender, state.heartbeat_interval, last_seen.clone());

    let relay = state.relay.clone();
    let reader_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("WebSocket error for {}: {}", reader_handle.user_id(), e);
                    break;
                }
            };
            if let Ok(mut seen) = last_seen.lock() {
                *seen = Instant::now();
            }

            match msg {
                Message::Text(text) => {
                    let result = match parse_action(text.as_str()) {
                        Ok(action) => relay.handle_action(&reader_handle, action).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        debug!("Action from {} failed: {}", reader_handle.user_id(), e);
                        reader_handle.send(ServerEvent::from_error(&e));
                    }
                }
                Message::Binary(_) => {
                    reader_handle.send(ServerEvent::from(&ChatError::InvalidRequest {
                        reason: "binary frames are not supported".to_string(),
                    }));
                }
                Message::Close(_) => {
                    debug!("{} requested close", reader_handle.user_id());
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    };

    if let Err(e) = state.relay.disconnect(&handle).await {
        warn!("Disconnect bookkeeping for {} failed: {}", user_id, e);
    }
    info!("{} disconnected", user_id);
}

/// Drain the handle's queue into the socket and keep the heartbeat going
fn pusher_loop(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sender: SplitSink<WebSocket, Message>,
    heartbeat: Duration,
    last_seen: Arc<Mutex<Instant>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(Outbound::Event(event)) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                error!("Failed to encode {}: {}", event.name(), e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    let idle = last_seen
                        .lock()
                        .map(|seen| seen.elapsed())
                        .unwrap_or_default();
                    if idle > heartbeat * 2 {
                        debug!("Heartbeat timeout after {:?} of silence", idle);
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_CODE_HEARTBEAT,
                                reason: "heartbeat timeout".into(),
                            })))
                            .await;
                        break;
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn error_response(err: &anyhow::Error) -> Response {
    let status = match err.downcast_ref::<ChatError>() {
        Some(ChatError::Unauthorized { .. }) => StatusCode::UNAUTHORIZED,
        Some(ChatError::NotParticipant { .. }) => StatusCode::FORBIDDEN,
        Some(ChatError::RoomNotFound { .. }) => StatusCode::NOT_FOUND,
        Some(ChatError::InvalidRequest { .. }) => StatusCode::BAD_REQUEST,
        Some(ChatError::RoomClosed { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ServerEvent::from_error(err))).into_response()
}

fn unauthorized(reason: &str) -> Response {
    error_response(
        &ChatError::Unauthorized {
            reason: reason.to_string(),
        }
        .into(),
    )
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

async fn backlog_handler(
    State(state): State<GatewayState>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<BacklogQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = header_token(&headers) else {
        return unauthorized("missing bearer token");
    };
    let user_id = match state.authenticator.authenticate(token).await {
        Ok(user_id) => user_id,
        Err(e) => return error_response(&e),
    };

    match state.relay.backlog(&user_id, room_id, query.since).await {
        Ok(events) => Json(json!({
            "roomId": room_id,
            "events": events,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn admin_close_handler(
    State(state): State<GatewayState>,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
) -> Response {
    let authorized = match (&state.admin_token, header_token(&headers)) {
        (Some(expected), Some(token)) => expected == token,
        _ => false,
    };
    if !authorized {
        return unauthorized("admin token required");
    }

    match state.relay.admin_close(room_id).await {
        Ok(CloseOutcome::Closed(room)) => Json(json!({
            "roomId": room.room_id,
            "closed": true,
            "alreadyClosed": false,
        }))
        .into_response(),
        Ok(CloseOutcome::AlreadyClosed) | Ok(CloseOutcome::Pending) => Json(json!({
            "roomId": room_id,
            "closed": true,
            "alreadyClosed": true,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}
