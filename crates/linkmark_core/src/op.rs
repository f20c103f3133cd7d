//! Mutation operation model: the unit of replication.
//!
//! Every change to the document (creating a bookmark, editing a field,
//! tagging, tombstoning) is expressed as an immutable [`Operation`] carrying
//! a schema-validated [`FieldMutation`] payload. Operations are
//! content-addressed: the blake3 hash over `(actor_id, sequence_number,
//! payload)` identifies an operation for the life of the log and makes
//! replay idempotent (re-submitting a known hash is a no-op, not an error).

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Device identity within the operation log (distinct from the account).
pub type ActorId = String;

/// Stable entity identifier, unique across devices for the life of the
/// entity, including after tombstoning.
pub type EntityId = String;

/// Lamport-style logical timestamp used for per-field conflict resolution.
pub type LogicalTimestamp = u64;

/// Server-assigned monotonic acceptance id (the log's total order).
pub type OperationId = i64;

/// Kind of entity a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Bookmark,
    Folder,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Bookmark => write!(f, "bookmark"),
            EntityKind::Folder => write!(f, "folder"),
        }
    }
}

/// Mergeable scalar fields, shared across entity kinds.
///
/// Which fields are valid for which kind is fixed by [`field_schema`];
/// arbitrary field assignment is rejected at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Url,
    Title,
    Description,
    Notes,
    FolderId,
    Favicon,
    Pinned,
    ParentId,
    Deleted,
}

impl std::fmt::Display for FieldName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldName::Url => "url",
            FieldName::Title => "title",
            FieldName::Description => "description",
            FieldName::Notes => "notes",
            FieldName::FolderId => "folder_id",
            FieldName::Favicon => "favicon",
            FieldName::Pinned => "pinned",
            FieldName::ParentId => "parent_id",
            FieldName::Deleted => "deleted",
        };
        write!(f, "{}", name)
    }
}

/// Typed value carried by a field mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Required text (url, title)
    Text(String),
    /// Optional text (description, notes, favicon)
    OptText(Option<String>),
    /// Boolean flag (pinned, deleted)
    Flag(bool),
    /// Optional reference to another entity (folder_id, parent_id)
    EntityRef(Option<EntityId>),
}

/// Value shape expected for a field, used for schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    OptText,
    Flag,
    EntityRef,
}

impl FieldValue {
    /// The shape of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::OptText(_) => FieldType::OptText,
            FieldValue::Flag(_) => FieldType::Flag,
            FieldValue::EntityRef(_) => FieldType::EntityRef,
        }
    }
}

/// Fixed per-kind field schema.
///
/// Returns the expected value shape for `(kind, field)`, or `None` when the
/// field does not exist on that entity kind.
pub fn field_schema(kind: EntityKind, field: FieldName) -> Option<FieldType> {
    match (kind, field) {
        (EntityKind::Bookmark, FieldName::Url) => Some(FieldType::Text),
        (EntityKind::Bookmark, FieldName::Title) => Some(FieldType::Text),
        (EntityKind::Bookmark, FieldName::Description) => Some(FieldType::OptText),
        (EntityKind::Bookmark, FieldName::Notes) => Some(FieldType::OptText),
        (EntityKind::Bookmark, FieldName::Favicon) => Some(FieldType::OptText),
        (EntityKind::Bookmark, FieldName::FolderId) => Some(FieldType::EntityRef),
        (EntityKind::Bookmark, FieldName::Pinned) => Some(FieldType::Flag),
        (EntityKind::Bookmark, FieldName::Deleted) => Some(FieldType::Flag),
        (EntityKind::Folder, FieldName::Title) => Some(FieldType::Text),
        (EntityKind::Folder, FieldName::ParentId) => Some(FieldType::EntityRef),
        (EntityKind::Folder, FieldName::Deleted) => Some(FieldType::Flag),
        _ => None,
    }
}

/// Initial field values for a whole-entity create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntitySeed {
    Bookmark {
        url: String,
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        folder_id: Option<EntityId>,
        #[serde(default)]
        favicon: Option<String>,
        #[serde(default)]
        pinned: bool,
        /// Initial tag set. Kept sorted so the canonical payload bytes (and
        /// therefore the content hash) do not depend on insertion order.
        #[serde(default)]
        tags: Vec<String>,
    },
    Folder {
        title: String,
        #[serde(default)]
        parent_id: Option<EntityId>,
    },
}

impl EntitySeed {
    /// The entity kind this seed materializes.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntitySeed::Bookmark { .. } => EntityKind::Bookmark,
            EntitySeed::Folder { .. } => EntityKind::Folder,
        }
    }
}

/// The field-level mutation payload of an operation.
///
/// Tagged variants validated against the fixed per-kind schema replace the
/// arbitrary field assignment the original client performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldMutation {
    /// Materialize a whole entity. Replayed over an existing id, every seeded
    /// field folds in under the same last-writer-wins rule as [`Self::SetField`].
    Create {
        entity_id: EntityId,
        seed: EntitySeed,
        logical_ts: LogicalTimestamp,
    },
    /// Write one scalar field of an existing entity.
    SetField {
        entity_kind: EntityKind,
        entity_id: EntityId,
        field: FieldName,
        value: FieldValue,
        logical_ts: LogicalTimestamp,
    },
    /// Add an element to a bookmark's tag set (add-wins observed-remove).
    AddTag {
        entity_id: EntityId,
        tag: String,
        logical_ts: LogicalTimestamp,
    },
    /// Remove an element from a bookmark's tag set. Only wins over a
    /// concurrent add when its logical timestamp is strictly later.
    RemoveTag {
        entity_id: EntityId,
        tag: String,
        logical_ts: LogicalTimestamp,
    },
}

impl FieldMutation {
    /// Target entity id.
    pub fn entity_id(&self) -> &str {
        match self {
            FieldMutation::Create { entity_id, .. }
            | FieldMutation::SetField { entity_id, .. }
            | FieldMutation::AddTag { entity_id, .. }
            | FieldMutation::RemoveTag { entity_id, .. } => entity_id,
        }
    }

    /// Logical timestamp of this mutation.
    pub fn logical_ts(&self) -> LogicalTimestamp {
        match self {
            FieldMutation::Create { logical_ts, .. }
            | FieldMutation::SetField { logical_ts, .. }
            | FieldMutation::AddTag { logical_ts, .. }
            | FieldMutation::RemoveTag { logical_ts, .. } => *logical_ts,
        }
    }

    /// Structural validation against the fixed entity schema.
    fn validate(&self) -> Result<()> {
        match self {
            FieldMutation::Create { entity_id, seed, .. } => {
                if entity_id.is_empty() {
                    return Err(SyncError::MalformedOperation(
                        "create with empty entity id".into(),
                    ));
                }
                if let EntitySeed::Bookmark { url, tags, .. } = seed {
                    if url.is_empty() {
                        return Err(SyncError::MalformedOperation(
                            "bookmark create with empty url".into(),
                        ));
                    }
                    if tags.windows(2).any(|w| w[0] >= w[1]) {
                        return Err(SyncError::MalformedOperation(
                            "bookmark create tags must be sorted and unique".into(),
                        ));
                    }
                }
                Ok(())
            }
            FieldMutation::SetField {
                entity_kind,
                entity_id,
                field,
                value,
                ..
            } => {
                if entity_id.is_empty() {
                    return Err(SyncError::MalformedOperation(
                        "set_field with empty entity id".into(),
                    ));
                }
                match field_schema(*entity_kind, *field) {
                    None => Err(SyncError::MalformedOperation(format!(
                        "field '{}' does not exist on entity kind '{}'",
                        field, entity_kind
                    ))),
                    Some(expected) if expected != value.field_type() => {
                        Err(SyncError::MalformedOperation(format!(
                            "value shape mismatch for '{}.{}'",
                            entity_kind, field
                        )))
                    }
                    Some(_) => Ok(()),
                }
            }
            FieldMutation::AddTag { entity_id, tag, .. }
            | FieldMutation::RemoveTag { entity_id, tag, .. } => {
                if entity_id.is_empty() {
                    return Err(SyncError::MalformedOperation(
                        "tag mutation with empty entity id".into(),
                    ));
                }
                if tag.is_empty() {
                    return Err(SyncError::MalformedOperation("empty tag".into()));
                }
                Ok(())
            }
        }
    }
}

/// One atomic, hashable, replayable mutation record.
///
/// Immutable once accepted. `(actor_id, sequence_number)` is unique per log;
/// `content_hash` is unique across the whole log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Originating device identity.
    pub actor_id: ActorId,
    /// Monotonically increasing, gap-free per actor, starting at 1.
    pub sequence_number: u64,
    /// blake3 hex digest over `(actor_id, sequence_number, payload)`.
    pub content_hash: String,
    /// The field-level mutation.
    pub payload: FieldMutation,
    /// Wall-clock creation time at the originating device (unix millis).
    pub created_at: i64,
}

impl Operation {
    /// Build an operation, computing its content hash.
    pub fn new(
        actor_id: impl Into<ActorId>,
        sequence_number: u64,
        payload: FieldMutation,
        created_at: i64,
    ) -> Self {
        let actor_id = actor_id.into();
        let content_hash = Self::compute_hash(&actor_id, sequence_number, &payload);
        Self {
            actor_id,
            sequence_number,
            content_hash,
            payload,
            created_at,
        }
    }

    /// Deterministic content hash: blake3 over the actor id, the sequence
    /// number and the canonical JSON encoding of the payload.
    ///
    /// `created_at` is deliberately excluded so a device re-stamping a
    /// retried submission still deduplicates.
    pub fn compute_hash(actor_id: &str, sequence_number: u64, payload: &FieldMutation) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(actor_id.as_bytes());
        hasher.update(&[0u8]);
        hasher.update(&sequence_number.to_le_bytes());
        hasher.update(&[0u8]);
        // Fixed struct/variant field order makes this encoding canonical.
        let payload_bytes =
            serde_json::to_vec(payload).expect("field mutation serialization is infallible");
        hasher.update(&payload_bytes);
        hasher.finalize().to_hex().to_string()
    }

    /// Logical timestamp carried by the payload.
    pub fn logical_ts(&self) -> LogicalTimestamp {
        self.payload.logical_ts()
    }

    /// Target entity id.
    pub fn entity_id(&self) -> &str {
        self.payload.entity_id()
    }

    /// Full structural validation: payload schema, identity fields, and
    /// content-hash integrity. Runs at every trust boundary (log append,
    /// session receive); failures are rejected, never partially applied.
    pub fn validate(&self) -> Result<()> {
        if self.actor_id.is_empty() {
            return Err(SyncError::MalformedOperation("empty actor id".into()));
        }
        if self.sequence_number == 0 {
            return Err(SyncError::MalformedOperation(
                "sequence numbers start at 1".into(),
            ));
        }
        self.payload.validate()?;
        let expected = Self::compute_hash(&self.actor_id, self.sequence_number, &self.payload);
        if expected != self.content_hash {
            return Err(SyncError::MalformedOperation(format!(
                "content hash mismatch for ({}, {})",
                self.actor_id, self.sequence_number
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_title(ts: u64) -> FieldMutation {
        FieldMutation::SetField {
            entity_kind: EntityKind::Bookmark,
            entity_id: "b1".into(),
            field: FieldName::Title,
            value: FieldValue::Text("Rust".into()),
            logical_ts: ts,
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = Operation::new("device-a", 1, set_title(10), 1000);
        let b = Operation::new("device-a", 1, set_title(10), 2000);
        // created_at is not part of the hash preimage
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_hash_distinguishes_actor_seq_and_payload() {
        let base = Operation::new("device-a", 1, set_title(10), 0);
        assert_ne!(
            base.content_hash,
            Operation::new("device-b", 1, set_title(10), 0).content_hash
        );
        assert_ne!(
            base.content_hash,
            Operation::new("device-a", 2, set_title(10), 0).content_hash
        );
        assert_ne!(
            base.content_hash,
            Operation::new("device-a", 1, set_title(11), 0).content_hash
        );
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let op = Operation::new("device-a", 1, set_title(10), 0);
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tampered_hash() {
        let mut op = Operation::new("device-a", 1, set_title(10), 0);
        op.content_hash = "deadbeef".into();
        assert!(matches!(
            op.validate(),
            Err(SyncError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_field_for_kind() {
        // Folders have no url field
        let op = Operation::new(
            "device-a",
            1,
            FieldMutation::SetField {
                entity_kind: EntityKind::Folder,
                entity_id: "f1".into(),
                field: FieldName::Url,
                value: FieldValue::Text("https://example.com".into()),
                logical_ts: 1,
            },
            0,
        );
        assert!(matches!(
            op.validate(),
            Err(SyncError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_value_shape_mismatch() {
        let op = Operation::new(
            "device-a",
            1,
            FieldMutation::SetField {
                entity_kind: EntityKind::Bookmark,
                entity_id: "b1".into(),
                field: FieldName::Pinned,
                value: FieldValue::Text("yes".into()),
                logical_ts: 1,
            },
            0,
        );
        assert!(matches!(
            op.validate(),
            Err(SyncError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unsorted_seed_tags() {
        let op = Operation::new(
            "device-a",
            1,
            FieldMutation::Create {
                entity_id: "b1".into(),
                seed: EntitySeed::Bookmark {
                    url: "https://example.com".into(),
                    title: "Example".into(),
                    description: None,
                    notes: None,
                    folder_id: None,
                    favicon: None,
                    pinned: false,
                    tags: vec!["vue".into(), "js".into()],
                },
                logical_ts: 1,
            },
            0,
        );
        assert!(matches!(
            op.validate(),
            Err(SyncError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_payload_roundtrip_preserves_hash() {
        let op = Operation::new("device-a", 7, set_title(42), 123);
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(op, back);
    }
}
