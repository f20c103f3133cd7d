use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use linkmark_core::error::SyncError;
use linkmark_core::op::OperationId;
use linkmark_core::oplog::AppendOutcome;
use linkmark_core::sync::{ClientMessage, ServerMessage};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::identity::{AuthedSession, SessionVerifier};
use crate::sync::{AccountHub, ConnectionEvent, DeviceConnection, HubRegistry};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Account to sync
    pub account: String,
    /// Device identity within the account
    pub device: String,
    /// Connection token (when the deployment requires one)
    pub token: Option<String>,
}

/// Shared state for the WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<HubRegistry>,
    pub verifier: Arc<dyn SessionVerifier>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session = match state
        .verifier
        .verify(&query.account, &query.device, query.token.as_deref())
    {
        Some(s) => s,
        None => {
            warn!("WebSocket connection rejected: invalid credentials");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    info!(
        "WebSocket upgrade: account={}, device={}",
        session.account_id, session.device_id
    );

    ws.on_upgrade(move |socket| handle_socket(socket, state, session))
        .into_response()
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: WsState, session: AuthedSession) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let hub = state.registry.get_or_create_hub(&session.account_id).await;

    // The device opens with a handshake carrying its applied cursor.
    let cursor = match await_handshake(&mut ws_rx, &session).await {
        Some(cursor) => cursor,
        None => {
            debug!("connection closed before handshake");
            state.registry.maybe_remove_hub(&session.account_id).await;
            return;
        }
    };
    // Record what the device reports as applied; the upsert never regresses.
    if cursor > 0 {
        if let Err(e) = hub.save_cursor(&session.device_id, cursor) {
            error!("failed to persist handshake cursor: {}", e);
        }
    }

    // Subscribe before catch-up so nothing accepted mid-stream is missed;
    // at-least-once delivery plus hash dedup makes the overlap safe.
    let mut connection = DeviceConnection::new(
        session.account_id.clone(),
        session.device_id.clone(),
        hub.clone(),
    );

    info!(
        "WebSocket connected: account={}, device={}, connections={}",
        session.account_id,
        session.device_id,
        hub.connection_count()
    );

    if !run_catchup(&mut ws_tx, &hub, &session, cursor).await {
        state.registry.maybe_remove_hub(&session.account_id).await;
        return;
    }

    // Live phase: bidirectional exchange until the transport drops.
    loop {
        tokio::select! {
            // Operations and acks from the device
            maybe_msg = ws_rx.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => {
                                if !handle_client_message(&mut ws_tx, &hub, &session, msg).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("undecodable client message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("device requested close");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            // Fan-out from the account's other devices
            event = connection.recv() => {
                match event {
                    ConnectionEvent::Deliver(stored) => {
                        if send_server_message(&mut ws_tx, &ServerMessage::operation(&stored))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ConnectionEvent::CatchupRequired => {
                        // Queue overflowed: notify-only degradation. Replay
                        // incrementally from the persisted cursor rather
                        // than buffering the backlog in memory.
                        let cursor = hub.cursor_for(&session.device_id).unwrap_or(0);
                        if !run_catchup(&mut ws_tx, &hub, &session, cursor).await {
                            break;
                        }
                    }
                    ConnectionEvent::Closed => break,
                }
            }
        }
    }

    info!(
        "WebSocket disconnected: account={}, device={}",
        session.account_id, session.device_id
    );

    // Dropping the connection unsubscribes from the hub
    drop(connection);
    state.registry.maybe_remove_hub(&session.account_id).await;
}

/// Wait for the opening handshake; returns the device's reported cursor.
async fn await_handshake(
    ws_rx: &mut SplitStream<WebSocket>,
    session: &AuthedSession,
) -> Option<OperationId> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Handshake { device_id, cursor }) => {
                    if device_id != session.device_id {
                        warn!(
                            "handshake device '{}' does not match authenticated device '{}'",
                            device_id, session.device_id
                        );
                        return None;
                    }
                    return Some(cursor.unwrap_or(0));
                }
                Ok(other) => {
                    warn!("expected handshake, got {:?}", other);
                    return None;
                }
                Err(e) => {
                    warn!("undecodable handshake: {}", e);
                    return None;
                }
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

/// Stream the catch-up set. Returns false when the device disconnected
/// mid-stream (safe to abandon: the only server-side progress is the
/// cursor already persisted per acked operation).
async fn run_catchup(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    hub: &Arc<AccountHub>,
    session: &AuthedSession,
    cursor: OperationId,
) -> bool {
    let plan = match hub.catchup_plan(cursor) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(
                "catch-up impossible for device {} at cursor {}: {}",
                session.device_id, cursor, e
            );
            let _ = send_server_message(
                ws_tx,
                &ServerMessage::ResyncRequired {
                    reason: e.to_string(),
                },
            )
            .await;
            return false;
        }
    };

    let begin = ServerMessage::CatchupBegin {
        estimated_count: plan.estimated_count(),
    };
    if send_server_message(ws_tx, &begin).await.is_err() {
        return false;
    }

    if let Some(snapshot) = &plan.snapshot {
        let data = match serde_json::from_slice(&snapshot.data) {
            Ok(data) => data,
            Err(e) => {
                error!("snapshot {} undecodable: {}", snapshot.id, e);
                let _ = send_server_message(
                    ws_tx,
                    &ServerMessage::ResyncRequired {
                        reason: "snapshot unavailable".into(),
                    },
                )
                .await;
                return false;
            }
        };
        let msg = ServerMessage::Snapshot {
            last_operation_id: snapshot.last_operation_id,
            data,
        };
        if send_server_message(ws_tx, &msg).await.is_err() {
            return false;
        }
    }

    for stored in &plan.operations {
        if send_server_message(ws_tx, &ServerMessage::operation(stored))
            .await
            .is_err()
        {
            debug!(
                "device {} disconnected mid-catch-up; will resume from its cursor",
                session.device_id
            );
            return false;
        }
    }

    send_server_message(ws_tx, &ServerMessage::CatchupEnd {})
        .await
        .is_ok()
}

/// Handle one live-phase client message. Returns false to close the
/// connection.
async fn handle_client_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    hub: &Arc<AccountHub>,
    session: &AuthedSession,
    msg: ClientMessage,
) -> bool {
    match msg {
        ClientMessage::Operation { .. } => {
            let op = match msg.into_operation() {
                Some(op) => op,
                None => return true,
            };
            let content_hash = op.content_hash.clone();

            match hub.submit(&session.device_id, &op).await {
                Ok(AppendOutcome::Accepted(_)) | Ok(AppendOutcome::Duplicate(_)) => {
                    send_server_message(ws_tx, &ServerMessage::Ack { content_hash })
                        .await
                        .is_ok()
                }
                Err(SyncError::SequenceGap {
                    expected, got, ..
                }) => {
                    // never silently healed: force an explicit resync
                    let _ = send_server_message(
                        ws_tx,
                        &ServerMessage::ResyncRequired {
                            reason: format!(
                                "sequence gap: expected {}, got {}",
                                expected, got
                            ),
                        },
                    )
                    .await;
                    false
                }
                Err(SyncError::MalformedOperation(reason)) => {
                    // rejected, never appended; surfaced to this device only
                    send_server_message(
                        ws_tx,
                        &ServerMessage::Rejected {
                            content_hash,
                            reason,
                        },
                    )
                    .await
                    .is_ok()
                }
                Err(e) => {
                    // storage failure: fatal for this request; the device
                    // retries the same operation, safe under hash dedup
                    error!("operation append failed: {}", e);
                    false
                }
            }
        }
        ClientMessage::Ack { content_hash } => {
            if let Err(e) = hub.ack(&session.device_id, &content_hash) {
                error!("ack persistence failed: {}", e);
            }
            true
        }
        ClientMessage::Handshake { .. } => {
            warn!("unexpected handshake during live phase");
            true
        }
    }
}

async fn send_server_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).expect("server messages serialize");
    ws_tx.send(Message::Text(json.into())).await
}
