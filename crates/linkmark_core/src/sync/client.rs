//! Native WebSocket sync client (tokio-tungstenite).
//!
//! Drives a [`SyncSession`] over a real connection: handshake, catch-up,
//! live exchange, and reconnection under the session's [`RetryPolicy`].
//! Local edits arrive over an mpsc channel so the UI thread never touches
//! the socket.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{Result, SyncError};
use crate::op::Operation;
use crate::sync::messages::{ClientMessage, ServerMessage};
use crate::sync::retry::{RetryPolicy, RetryState};
use crate::sync::session::SyncSession;

/// Why one connection attempt ended.
enum ConnectionExit {
    /// The local operation channel closed; the caller is shutting down.
    LocalClosed,
    /// The server demanded a resync; the session must reset its cursor.
    ResyncRequired,
}

/// WebSocket sync client for one device.
pub struct SyncClient {
    server_url: String,
    policy: RetryPolicy,
}

impl SyncClient {
    /// `server_url` is the base ws(s) endpoint, e.g. `wss://sync.example.org`.
    pub fn new(server_url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            server_url: server_url.into(),
            policy,
        }
    }

    fn endpoint(&self, session: &SyncSession) -> Result<String> {
        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| SyncError::Transport(format!("invalid server url: {}", e)))?;
        url.set_path("/sync");
        url.query_pairs_mut()
            .clear()
            .append_pair("account", &session.context().account_id)
            .append_pair("device", &session.context().device_id);
        Ok(url.to_string())
    }

    /// Run the sync loop until the local operation channel closes.
    ///
    /// Reconnects on transport failure per the retry policy; returns the
    /// session (with its advanced cursor) so the caller can persist it.
    pub async fn run(
        &self,
        mut session: SyncSession,
        mut local_ops: mpsc::Receiver<Operation>,
    ) -> Result<SyncSession> {
        let mut retry = RetryState::new();
        loop {
            match self
                .run_connection(&mut session, &mut local_ops, &mut retry)
                .await
            {
                Ok(ConnectionExit::LocalClosed) => return Ok(session),
                Ok(ConnectionExit::ResyncRequired) => {
                    log::warn!("server requested resync; resetting cursor");
                    session.reset_for_resync();
                }
                Err(e) => {
                    log::warn!("sync connection failed: {}", e);
                    session.disconnect();
                }
            }

            match retry.record_failure(&self.policy) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(SyncError::Transport(
                        "reconnect retry policy exhausted".into(),
                    ))
                }
            }
        }
    }

    async fn run_connection(
        &self,
        session: &mut SyncSession,
        local_ops: &mut mpsc::Receiver<Operation>,
        retry: &mut RetryState,
    ) -> Result<ConnectionExit> {
        let endpoint = self.endpoint(session)?;
        let (stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = stream.split();

        let handshake = session.connect();
        send_message(&mut ws_tx, &handshake).await?;
        retry.record_success();

        loop {
            tokio::select! {
                maybe_op = local_ops.recv() => {
                    match maybe_op {
                        None => return Ok(ConnectionExit::LocalClosed),
                        Some(op) => {
                            if let Some(msg) = session.stage(op) {
                                send_message(&mut ws_tx, &msg).await?;
                            }
                        }
                    }
                }

                maybe_msg = ws_rx.next() => {
                    let msg = match maybe_msg {
                        None => return Err(SyncError::Transport("connection closed".into())),
                        Some(Err(e)) => return Err(SyncError::Transport(e.to_string())),
                        Some(Ok(msg)) => msg,
                    };

                    match msg {
                        Message::Text(text) => {
                            let server_msg: ServerMessage = serde_json::from_str(text.as_str())?;
                            let is_resync =
                                matches!(server_msg, ServerMessage::ResyncRequired { .. });
                            match session.handle(server_msg) {
                                Ok(replies) => {
                                    for reply in replies {
                                        send_message(&mut ws_tx, &reply).await?;
                                    }
                                }
                                Err(_) if is_resync => return Ok(ConnectionExit::ResyncRequired),
                                Err(e) => return Err(e),
                            }
                        }
                        Message::Close(_) => {
                            return Err(SyncError::Transport("server closed connection".into()))
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

async fn send_message<S>(ws_tx: &mut S, msg: &ClientMessage) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg)?;
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))
}
