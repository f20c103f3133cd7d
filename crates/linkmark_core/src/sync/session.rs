//! Per-device sync session: the client half of the protocol.
//!
//! `SyncSession` is transport-free: callers feed it [`ServerMessage`]s and
//! send whatever [`ClientMessage`]s it returns. The WebSocket (or any other
//! transport) is a consumer of the session, never an owner of sync state;
//! there is no ambient connection singleton.

use std::collections::VecDeque;

use crate::error::{Result, SyncError};
use crate::model::{Document, Replica};
use crate::op::{Operation, OperationId};
use crate::sync::messages::{ClientMessage, ServerMessage};

/// Identifies one account-device pair. Constructed per connection and
/// passed explicitly to every sync operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub account_id: String,
    pub device_id: String,
}

impl SessionContext {
    pub fn new(account_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Connection lifecycle: `Disconnected → Handshaking → CatchingUp → Live`,
/// back to `Disconnected` on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    CatchingUp { expected: u64, applied: u64 },
    Live,
}

/// Client-side sync state machine for one device.
///
/// The session advances its cursor operation-by-operation as it applies,
/// so an interrupted catch-up resumes where it left off rather than
/// restarting. Local edits made while offline (or mid-catch-up) queue in
/// `pending` and flush when the session goes live; unacknowledged
/// operations are re-sent on reconnect, which hash dedup makes harmless.
#[derive(Debug)]
pub struct SyncSession {
    ctx: SessionContext,
    state: SessionState,
    replica: Replica,
    cursor: OperationId,
    pending: VecDeque<Operation>,
}

impl SyncSession {
    /// Create a session around an existing replica, resuming from the last
    /// applied cursor (0 for a first run).
    pub fn new(ctx: SessionContext, replica: Replica, cursor: OperationId) -> Self {
        Self {
            ctx,
            state: SessionState::Disconnected,
            replica,
            cursor,
            pending: VecDeque::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cursor(&self) -> OperationId {
        self.cursor
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Mutable replica access for local edits. Pass every emitted operation
    /// to [`Self::stage`] so it reaches the server.
    pub fn replica_mut(&mut self) -> &mut Replica {
        &mut self.replica
    }

    /// Operations emitted locally but not yet acknowledged by the server.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the device can prove its document is fully caught up.
    /// Anything else renders as "reconnecting / resyncing".
    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    /// Begin a connection attempt: returns the handshake to send.
    pub fn connect(&mut self) -> ClientMessage {
        self.state = SessionState::Handshaking;
        ClientMessage::Handshake {
            device_id: self.ctx.device_id.clone(),
            cursor: if self.cursor > 0 {
                Some(self.cursor)
            } else {
                None
            },
        }
    }

    /// Transport failure: drop back to `Disconnected`. The cursor and the
    /// pending queue survive; the next [`Self::connect`] resumes from the
    /// last *applied* operation.
    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }

    /// Queue a locally emitted operation for the server. Returns the wire
    /// message when the session is live, None while it must wait for the
    /// catch-up to finish (the flush happens on `catchup_end`).
    pub fn stage(&mut self, op: Operation) -> Option<ClientMessage> {
        self.pending.push_back(op.clone());
        if self.is_live() {
            Some(ClientMessage::operation(&op))
        } else {
            None
        }
    }

    /// Feed one server message through the state machine; returns the
    /// messages to send back.
    pub fn handle(&mut self, msg: ServerMessage) -> Result<Vec<ClientMessage>> {
        match msg {
            ServerMessage::CatchupBegin { estimated_count } => {
                self.state = SessionState::CatchingUp {
                    expected: estimated_count,
                    applied: 0,
                };
                Ok(vec![])
            }
            ServerMessage::Snapshot {
                last_operation_id,
                data,
            } => {
                let doc: Document = serde_json::from_value(data)?;
                self.replica.reset_document(doc);
                // local edits made against the replaced state are still in
                // `pending`; re-apply so the view keeps them until acked
                let pending: Vec<Operation> = self.pending.iter().cloned().collect();
                for op in &pending {
                    self.replica.observe(op);
                }
                self.cursor = last_operation_id;
                Ok(vec![])
            }
            ServerMessage::Operation {
                id,
                actor_id,
                sequence_number,
                content_hash,
                payload,
                created_at,
            } => {
                let op = Operation {
                    actor_id,
                    sequence_number,
                    content_hash,
                    payload,
                    created_at,
                };
                op.validate()?;

                let is_echo = op.actor_id == self.replica.actor_id();
                self.replica.observe(&op);
                // advance per applied operation, so a cut catch-up resumes
                self.cursor = self.cursor.max(id);

                if let SessionState::CatchingUp { expected, applied } = self.state {
                    self.state = SessionState::CatchingUp {
                        expected,
                        applied: applied + 1,
                    };
                }

                if is_echo {
                    // our own operation came back through the log
                    self.pending.retain(|p| p.content_hash != op.content_hash);
                    Ok(vec![])
                } else {
                    Ok(vec![ClientMessage::Ack {
                        content_hash: op.content_hash,
                    }])
                }
            }
            ServerMessage::CatchupEnd {} => {
                self.state = SessionState::Live;
                // flush everything the device queued while offline
                Ok(self
                    .pending
                    .iter()
                    .map(ClientMessage::operation)
                    .collect())
            }
            ServerMessage::Ack { content_hash } => {
                self.pending.retain(|p| p.content_hash != content_hash);
                Ok(vec![])
            }
            ServerMessage::Rejected {
                content_hash,
                reason,
            } => {
                // structurally invalid: drop it, retrying cannot succeed
                log::warn!("server rejected operation {}: {}", content_hash, reason);
                self.pending.retain(|p| p.content_hash != content_hash);
                Ok(vec![])
            }
            ServerMessage::ResyncRequired { reason } => {
                log::warn!(
                    "resync required for device {}: {}",
                    self.ctx.device_id,
                    reason
                );
                Err(SyncError::Transport(format!("resync required: {}", reason)))
            }
        }
    }

    /// Full cursor reset after `resync_required`: the next connect
    /// re-derives the document from a snapshot bootstrap plus replay.
    pub fn reset_for_resync(&mut self) {
        self.cursor = 0;
        self.state = SessionState::Disconnected;
        let actor = self.replica.actor_id().to_string();
        self.replica = Replica::new(actor);
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoredOperation;

    fn server_op(id: OperationId, op: &Operation) -> ServerMessage {
        ServerMessage::operation(&StoredOperation {
            id,
            account_id: "acct".into(),
            operation: op.clone(),
            accepted_at: id,
        })
    }

    fn session() -> SyncSession {
        SyncSession::new(
            SessionContext::new("acct", "dev-a"),
            Replica::new("dev-a"),
            0,
        )
    }

    #[test]
    fn test_first_run_handshake_has_no_cursor() {
        let mut s = session();
        let msg = s.connect();
        assert_eq!(s.state(), SessionState::Handshaking);
        assert_eq!(
            msg,
            ClientMessage::Handshake {
                device_id: "dev-a".into(),
                cursor: None
            }
        );
    }

    #[test]
    fn test_catchup_applies_and_advances_cursor_per_operation() {
        let mut remote = Replica::new("dev-b");
        let (id, create) = remote.create_bookmark("https://a.example", "A");
        let edit = remote.set_title(&id, "A2");

        let mut s = session();
        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 2 })
            .unwrap();

        let replies = s.handle(server_op(1, &create)).unwrap();
        assert_eq!(s.cursor(), 1);
        assert_eq!(
            replies,
            vec![ClientMessage::Ack {
                content_hash: create.content_hash.clone()
            }]
        );

        // interruption here would resume from cursor 1, not restart

        s.handle(server_op(2, &edit)).unwrap();
        assert_eq!(s.cursor(), 2);
        assert_eq!(
            s.state(),
            SessionState::CatchingUp {
                expected: 2,
                applied: 2
            }
        );

        s.handle(ServerMessage::CatchupEnd {}).unwrap();
        assert!(s.is_live());
        assert_eq!(
            s.replica().document().bookmark(&id).unwrap().title.value,
            "A2"
        );
    }

    #[test]
    fn test_reconnect_after_interruption_presents_applied_cursor() {
        let mut remote = Replica::new("dev-b");
        let (_, create) = remote.create_bookmark("https://a.example", "A");

        let mut s = session();
        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 5 })
            .unwrap();
        s.handle(server_op(7, &create)).unwrap();

        s.disconnect();
        let msg = s.connect();
        assert_eq!(
            msg,
            ClientMessage::Handshake {
                device_id: "dev-a".into(),
                cursor: Some(7)
            }
        );
    }

    #[test]
    fn test_offline_edits_flush_on_catchup_end() {
        let mut s = session();
        let op = {
            let (_, op) = s.replica_mut().create_bookmark("https://a.example", "A");
            op
        };
        // offline: staging returns nothing to send
        assert!(s.stage(op.clone()).is_none());
        assert_eq!(s.pending_count(), 1);

        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 0 })
            .unwrap();
        let flushed = s.handle(ServerMessage::CatchupEnd {}).unwrap();
        assert_eq!(flushed, vec![ClientMessage::operation(&op)]);
    }

    #[test]
    fn test_ack_clears_pending() {
        let mut s = session();
        let (_, op) = s.replica_mut().create_bookmark("https://a.example", "A");
        s.stage(op.clone());
        s.handle(ServerMessage::Ack {
            content_hash: op.content_hash.clone(),
        })
        .unwrap();
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn test_own_echo_clears_pending_without_ack() {
        let mut s = session();
        let (_, op) = s.replica_mut().create_bookmark("https://a.example", "A");
        s.stage(op.clone());

        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 1 })
            .unwrap();
        let replies = s.handle(server_op(1, &op)).unwrap();
        assert!(replies.is_empty(), "no self-ack for echoes");
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn test_snapshot_bootstrap_replaces_document_and_jumps_cursor() {
        let mut remote = Replica::new("dev-b");
        let (id, _) = remote.create_bookmark("https://a.example", "A");
        let snapshot_doc = serde_json::to_value(remote.document()).unwrap();

        let mut s = session();
        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 0 })
            .unwrap();
        s.handle(ServerMessage::Snapshot {
            last_operation_id: 700,
            data: snapshot_doc,
        })
        .unwrap();

        assert_eq!(s.cursor(), 700);
        assert!(s.replica().document().bookmark(&id).is_some());
    }

    #[test]
    fn test_live_staging_sends_immediately() {
        let mut s = session();
        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 0 })
            .unwrap();
        s.handle(ServerMessage::CatchupEnd {}).unwrap();

        let (_, op) = s.replica_mut().create_bookmark("https://a.example", "A");
        let msg = s.stage(op.clone());
        assert_eq!(msg, Some(ClientMessage::operation(&op)));
    }

    #[test]
    fn test_resync_required_resets_to_full_rederivation() {
        let mut s = session();
        s.connect();
        s.handle(ServerMessage::CatchupBegin { estimated_count: 0 })
            .unwrap();
        s.handle(ServerMessage::CatchupEnd {}).unwrap();

        let err = s.handle(ServerMessage::ResyncRequired {
            reason: "sequence gap".into(),
        });
        assert!(err.is_err());

        s.reset_for_resync();
        assert_eq!(s.cursor(), 0);
        assert_eq!(s.state(), SessionState::Disconnected);
        let msg = s.connect();
        assert_eq!(
            msg,
            ClientMessage::Handshake {
                device_id: "dev-a".into(),
                cursor: None
            }
        );
    }
}
