//! Wire protocol for device↔server synchronization.
//!
//! Messages are JSON text frames over a persistent connection, tagged with
//! a snake_case `type` field.
//!
//! # Protocol Overview
//!
//! 1. **Handshake**: the device presents its sync cursor (absent on first run)
//! 2. **Catch-up**: the server streams `catchup_begin`, an optional
//!    `snapshot` bootstrap (only when the cursor predates the retained
//!    operation tail), the missing operations, then `catchup_end`
//! 3. **Live**: operations flow bidirectionally; `ack` confirms application
//!    and advances the server-side cursor
//!
//! Delivery is at-least-once: a device may receive an operation it already
//! holds (catch-up racing live fan-out); content-hash dedup makes that safe.
//! `resync_required` is sent on a sequence gap and forces the device back
//! through a full handshake.

use serde::{Deserialize, Serialize};

use crate::op::{FieldMutation, Operation, OperationId};
use crate::storage::StoredOperation;

/// Messages sent by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the session. `cursor` is the last operation id the device has
    /// applied, or None for a first run.
    Handshake {
        device_id: String,
        cursor: Option<OperationId>,
    },
    /// A locally created operation submitted for acceptance.
    Operation {
        actor_id: String,
        sequence_number: u64,
        content_hash: String,
        payload: FieldMutation,
        created_at: i64,
    },
    /// Confirms application of a server-delivered operation; advances this
    /// device's server-side cursor.
    Ack { content_hash: String },
}

impl ClientMessage {
    pub fn operation(op: &Operation) -> Self {
        ClientMessage::Operation {
            actor_id: op.actor_id.clone(),
            sequence_number: op.sequence_number,
            content_hash: op.content_hash.clone(),
            payload: op.payload.clone(),
            created_at: op.created_at,
        }
    }

    /// Reassemble the operation from an `operation` message.
    pub fn into_operation(self) -> Option<Operation> {
        match self {
            ClientMessage::Operation {
                actor_id,
                sequence_number,
                content_hash,
                payload,
                created_at,
            } => Some(Operation {
                actor_id,
                sequence_number,
                content_hash,
                payload,
                created_at,
            }),
            _ => None,
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Catch-up is starting; `estimated_count` operations will follow.
    CatchupBegin { estimated_count: u64 },
    /// Full-document bootstrap. Sent when the device's cursor predates the
    /// retained operation tail; the device replaces its document and jumps
    /// its cursor to `last_operation_id`.
    Snapshot {
        last_operation_id: OperationId,
        data: serde_json::Value,
    },
    /// An accepted operation, with its acceptance id so the device can
    /// advance its cursor as it applies.
    Operation {
        id: OperationId,
        actor_id: String,
        sequence_number: u64,
        content_hash: String,
        payload: FieldMutation,
        created_at: i64,
    },
    /// Catch-up complete; the session is live.
    CatchupEnd {},
    /// The device's submitted operation was accepted (or was already in the
    /// log; a duplicate resolves to the same acknowledgement).
    Ack { content_hash: String },
    /// The device's submitted operation failed structural validation and
    /// was rejected. Surfaced to the submitting device only.
    Rejected { content_hash: String, reason: String },
    /// The device's operation history cannot be reconciled (sequence gap).
    /// It must re-handshake with a reset cursor and re-derive its state.
    ResyncRequired { reason: String },
}

impl ServerMessage {
    pub fn operation(stored: &StoredOperation) -> Self {
        ServerMessage::Operation {
            id: stored.id,
            actor_id: stored.operation.actor_id.clone(),
            sequence_number: stored.operation.sequence_number,
            content_hash: stored.operation.content_hash.clone(),
            payload: stored.operation.payload.clone(),
            created_at: stored.operation.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{EntityKind, FieldName, FieldValue};

    fn op() -> Operation {
        Operation::new(
            "dev-a",
            1,
            FieldMutation::SetField {
                entity_kind: EntityKind::Bookmark,
                entity_id: "b1".into(),
                field: FieldName::Title,
                value: FieldValue::Text("T".into()),
                logical_ts: 5,
            },
            1000,
        )
    }

    #[test]
    fn test_handshake_wire_shape() {
        let msg = ClientMessage::Handshake {
            device_id: "dev-a".into(),
            cursor: Some(42),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "handshake");
        assert_eq!(json["device_id"], "dev-a");
        assert_eq!(json["cursor"], 42);
    }

    #[test]
    fn test_operation_message_roundtrip() {
        let original = op();
        let msg = ClientMessage::operation(&original);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        let back = parsed.into_operation().unwrap();
        assert_eq!(back, original);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_server_message_tags() {
        let end = serde_json::to_value(ServerMessage::CatchupEnd {}).unwrap();
        assert_eq!(end["type"], "catchup_end");

        let resync = serde_json::to_value(ServerMessage::ResyncRequired {
            reason: "sequence gap".into(),
        })
        .unwrap();
        assert_eq!(resync["type"], "resync_required");
    }
}
