use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use cluster_core::config::ClusterConfig;
use cluster_core::store::Store;
use cluster_registry::Registry;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::TokenIssuer;
use crate::control_session::{ControlChannelHandle, ControlSession, State as SessionState};
use crate::event_bus::EventBus;
use crate::protocol::{self, encode_outbound};
use crate::pty_router::{self, PoolChannelHandle, TerminalChannelHandle};

/// Shared dependencies for all four channel kinds. Constructed once by
/// `cluster-server` and cloned (cheaply, via `Arc`) into every accepted
/// connection's task.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub event_bus: Arc<EventBus>,
    pub token_issuer: Arc<dyn TokenIssuer>,
    pub config: Arc<ClusterConfig>,
    pub bind_address: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/control", get(control_ws_handler))
        .route("/ws/pty/{pty_connection_id}", get(pool_ws_handler))
        .route("/ws/terminal/{agent_id}", get(terminal_ws_handler))
        .route("/ws/events", get(events_ws_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Daemon control channel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    #[serde(default)]
    pub token: Option<String>,
}

async fn control_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ControlQuery>,
) -> impl IntoResponse {
    if state.config.auth.require_bootstrap_token {
        let valid = query.token.as_deref().map(|t| state.token_issuer.validate_token(t)).unwrap_or(false);
        if !valid {
            return (StatusCode::UNAUTHORIZED, "invalid bootstrap token").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_control_ws(socket, state)).into_response()
}

async fn handle_control_ws(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut outbound_rx, mut close_rx) = ControlChannelHandle::new(state.config.control.intent_queue_depth);
    let mut session = ControlSession::new(
        state.store.clone(),
        state.registry.clone(),
        state.event_bus.clone(),
        state.token_issuer.clone(),
        state.config.control,
        state.config.network.clone(),
        state.bind_address.clone(),
        handle,
    );

    let handshake_deadline = tokio::time::sleep(Duration::from_secs(state.config.control.handshake_timeout_secs));
    tokio::pin!(handshake_deadline);

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match session.handle_message(&text).await {
                            Ok(Some(reply)) => {
                                if let Ok(json) = encode_outbound(&reply) {
                                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(e) if e.is_fatal() => {
                                tracing::warn!(daemon_id = ?session.daemon_id(), error = %e, "control channel protocol violation");
                                let _ = ws_tx.send(Message::Close(None)).await;
                                break;
                            }
                            Err(e) => {
                                let frame = serde_json::json!({"type": "error", "message": e.to_string()});
                                if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "control channel read error");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Ok(json) = encode_outbound(&msg) {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            changed = close_rx.changed() => {
                if changed.is_ok() {
                    let reason = close_rx.borrow().clone().unwrap_or_default();
                    tracing::debug!(reason, "control channel closed via registry");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = &mut handshake_deadline, if session.state() == SessionState::AwaitRegister => {
                tracing::warn!("control channel handshake timeout");
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    session.on_disconnect().await;
}

// ---------------------------------------------------------------------------
// PTY pool channel (daemon side)
// ---------------------------------------------------------------------------

async fn pool_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(pty_connection_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_pool_ws(socket, state, pty_connection_id)).into_response()
}

async fn handle_pool_ws(socket: WebSocket, state: Arc<AppState>, pty_connection_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let pool_id = protocol::pool_id_from_connection_id(&pty_connection_id);
    let (handle, mut close_rx) = PoolChannelHandle::new();
    state.registry.register_pool_channel(pool_id, handle);

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        pty_router::route_pool_frame(&state.registry, &data);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%pty_connection_id, error = %e, "pty pool channel read error");
                        break;
                    }
                }
            }
            changed = close_rx.changed() => {
                if changed.is_ok() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    pty_router::on_pool_closed(&state.registry, pool_id);
}

// ---------------------------------------------------------------------------
// Browser terminal channel
// ---------------------------------------------------------------------------

async fn terminal_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, Path(agent_id): Path<Uuid>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_ws(socket, state, agent_id)).into_response()
}

async fn handle_terminal_ws(socket: WebSocket, state: Arc<AppState>, agent_id: Uuid) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut outbound_rx, mut close_rx) = TerminalChannelHandle::new(state.config.control.intent_queue_depth);
    state.registry.register_terminal(agent_id, handle);

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = pty_router::route_browser_frame(&state.store, &state.registry, agent_id, data.to_vec()).await {
                            tracing::debug!(%agent_id, error = %e, "dropping browser input frame");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%agent_id, error = %e, "terminal channel read error");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            changed = close_rx.changed() => {
                if changed.is_ok() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    pty_router::on_terminal_closed(&state.registry, agent_id);
}

// ---------------------------------------------------------------------------
// Event subscription channel
// ---------------------------------------------------------------------------

async fn events_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state)).into_response()
}

async fn handle_events_ws(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sub_id, rx) = state.event_bus.subscribe();

    loop {
        tokio::select! {
            event = rx.recv_async() => {
                match event {
                    Ok(event) => {
                        let json = serde_json::to_string(&event).unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound frames on this channel are ignored -- it exists for
                    // liveness only (see wire protocol §6.4).
                    _ => {}
                }
            }
        }
    }

    state.event_bus.unsubscribe(sub_id);
}
