//! Per-device replica: translates mutation intents into operations.

use super::document::Document;
use crate::error::Result;
use crate::op::{
    ActorId, EntityId, EntityKind, EntitySeed, FieldMutation, FieldName, FieldValue, Operation,
};

/// A device's private copy of the document plus the machinery to mutate it.
///
/// Every local mutation produces an [`Operation`] (applied locally before it
/// is returned for transmission); the document is never edited in place
/// without one. The replica carries the device's Lamport clock and gap-free
/// sequence counter.
#[derive(Debug, Clone)]
pub struct Replica {
    actor_id: ActorId,
    doc: Document,
    clock: u64,
    next_seq: u64,
}

impl Replica {
    /// Create an empty replica for a device.
    pub fn new(actor_id: impl Into<ActorId>) -> Self {
        Self {
            actor_id: actor_id.into(),
            doc: Document::new(),
            clock: 0,
            next_seq: 1,
        }
    }

    /// Rebuild a replica from a materialized document (snapshot bootstrap).
    ///
    /// The Lamport clock resumes past every field timestamp in the document
    /// so subsequent local writes win over the state they were made against.
    pub fn from_document(actor_id: impl Into<ActorId>, doc: Document) -> Self {
        let clock = max_logical_ts(&doc);
        Self {
            actor_id: actor_id.into(),
            doc,
            clock,
            next_seq: 1,
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Replace the document wholesale (server snapshot bootstrap).
    pub fn reset_document(&mut self, doc: Document) {
        self.clock = self.clock.max(max_logical_ts(&doc));
        self.doc = doc;
    }

    /// Next sequence number this replica will emit.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    /// Apply an operation received from the log (another device, or an echo
    /// of our own). Advances the Lamport clock and, for echoes, the
    /// sequence counter, so a replica rebuilt from replay resumes correctly.
    pub fn observe(&mut self, op: &Operation) {
        self.clock = self.clock.max(op.logical_ts());
        if op.actor_id == self.actor_id {
            self.next_seq = self.next_seq.max(op.sequence_number + 1);
        }
        self.doc.apply(op);
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn emit(&mut self, payload: FieldMutation) -> Operation {
        let op = Operation::new(
            self.actor_id.clone(),
            self.next_seq,
            payload,
            chrono::Utc::now().timestamp_millis(),
        );
        self.next_seq += 1;
        self.doc.apply(&op);
        op
    }

    // ==================== Bookmark intents ====================

    /// Create a bookmark; returns its generated id and the operation.
    pub fn create_bookmark(&mut self, url: &str, title: &str) -> (EntityId, Operation) {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = self.tick();
        let op = self.emit(FieldMutation::Create {
            entity_id: id.clone(),
            seed: EntitySeed::Bookmark {
                url: url.to_string(),
                title: title.to_string(),
                description: None,
                notes: None,
                folder_id: None,
                favicon: None,
                pinned: false,
                tags: vec![],
            },
            logical_ts: ts,
        });
        (id, op)
    }

    fn set_bookmark_field(&mut self, id: &str, field: FieldName, value: FieldValue) -> Operation {
        let ts = self.tick();
        self.emit(FieldMutation::SetField {
            entity_kind: EntityKind::Bookmark,
            entity_id: id.to_string(),
            field,
            value,
            logical_ts: ts,
        })
    }

    pub fn set_url(&mut self, id: &str, url: &str) -> Operation {
        self.set_bookmark_field(id, FieldName::Url, FieldValue::Text(url.to_string()))
    }

    pub fn set_title(&mut self, id: &str, title: &str) -> Operation {
        self.set_bookmark_field(id, FieldName::Title, FieldValue::Text(title.to_string()))
    }

    pub fn set_description(&mut self, id: &str, description: Option<&str>) -> Operation {
        self.set_bookmark_field(
            id,
            FieldName::Description,
            FieldValue::OptText(description.map(String::from)),
        )
    }

    pub fn set_notes(&mut self, id: &str, notes: Option<&str>) -> Operation {
        self.set_bookmark_field(
            id,
            FieldName::Notes,
            FieldValue::OptText(notes.map(String::from)),
        )
    }

    pub fn set_favicon(&mut self, id: &str, favicon: Option<&str>) -> Operation {
        self.set_bookmark_field(
            id,
            FieldName::Favicon,
            FieldValue::OptText(favicon.map(String::from)),
        )
    }

    pub fn set_pinned(&mut self, id: &str, pinned: bool) -> Operation {
        self.set_bookmark_field(id, FieldName::Pinned, FieldValue::Flag(pinned))
    }

    pub fn move_to_folder(&mut self, id: &str, folder_id: Option<&str>) -> Operation {
        self.set_bookmark_field(
            id,
            FieldName::FolderId,
            FieldValue::EntityRef(folder_id.map(String::from)),
        )
    }

    pub fn add_tag(&mut self, id: &str, tag: &str) -> Operation {
        let ts = self.tick();
        self.emit(FieldMutation::AddTag {
            entity_id: id.to_string(),
            tag: tag.to_string(),
            logical_ts: ts,
        })
    }

    pub fn remove_tag(&mut self, id: &str, tag: &str) -> Operation {
        let ts = self.tick();
        self.emit(FieldMutation::RemoveTag {
            entity_id: id.to_string(),
            tag: tag.to_string(),
            logical_ts: ts,
        })
    }

    /// Tombstone a bookmark. The record stays mergeable for the retention
    /// window; see [`Self::restore_bookmark`].
    pub fn delete_bookmark(&mut self, id: &str) -> Operation {
        self.set_bookmark_field(id, FieldName::Deleted, FieldValue::Flag(true))
    }

    pub fn restore_bookmark(&mut self, id: &str) -> Operation {
        self.set_bookmark_field(id, FieldName::Deleted, FieldValue::Flag(false))
    }

    // ==================== Folder intents ====================

    pub fn create_folder(&mut self, title: &str, parent_id: Option<&str>) -> (EntityId, Operation) {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = self.tick();
        let op = self.emit(FieldMutation::Create {
            entity_id: id.clone(),
            seed: EntitySeed::Folder {
                title: title.to_string(),
                parent_id: parent_id.map(String::from),
            },
            logical_ts: ts,
        });
        (id, op)
    }

    fn set_folder_field(&mut self, id: &str, field: FieldName, value: FieldValue) -> Operation {
        let ts = self.tick();
        self.emit(FieldMutation::SetField {
            entity_kind: EntityKind::Folder,
            entity_id: id.to_string(),
            field,
            value,
            logical_ts: ts,
        })
    }

    pub fn rename_folder(&mut self, id: &str, title: &str) -> Operation {
        self.set_folder_field(id, FieldName::Title, FieldValue::Text(title.to_string()))
    }

    pub fn move_folder(&mut self, id: &str, parent_id: Option<&str>) -> Operation {
        self.set_folder_field(
            id,
            FieldName::ParentId,
            FieldValue::EntityRef(parent_id.map(String::from)),
        )
    }

    pub fn delete_folder(&mut self, id: &str) -> Operation {
        self.set_folder_field(id, FieldName::Deleted, FieldValue::Flag(true))
    }

    /// Validate and apply an externally constructed operation intent.
    pub fn apply_validated(&mut self, op: &Operation) -> Result<()> {
        op.validate()?;
        self.observe(op);
        Ok(())
    }
}

/// Greatest logical timestamp present in a document, used to resume a
/// Lamport clock after a snapshot bootstrap.
fn max_logical_ts(doc: &Document) -> u64 {
    let mut max = 0u64;
    for b in doc.bookmarks() {
        for ts in [
            b.url.logical_ts,
            b.title.logical_ts,
            b.description.logical_ts,
            b.notes.logical_ts,
            b.folder_id.logical_ts,
            b.favicon.logical_ts,
            b.pinned.logical_ts,
            b.deleted.logical_ts,
        ] {
            max = max.max(ts);
        }
    }
    for f in doc.folders() {
        for ts in [
            f.title.logical_ts,
            f.parent_id.logical_ts,
            f.deleted.logical_ts,
        ] {
            max = max.max(ts);
        }
    }
    max
}
