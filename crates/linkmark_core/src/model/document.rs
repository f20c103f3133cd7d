//! The materialized document: entity maps plus derived read views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entity::{Bookmark, Folder};
use crate::error::Result;
use crate::op::{EntityKind, FieldMutation, FieldName, FieldValue, Operation};

/// Derived tag reference counts over non-deleted bookmarks.
///
/// Recomputed from the document rather than incrementally adjusted, so a
/// count below zero is unrepresentable (the original client clamped
/// transiently negative counters; here the invariant holds by construction).
pub type TagCounts = BTreeMap<String, u64>;

/// In-memory representation of one account's bookmark collection.
///
/// `BTreeMap` entity maps keep the serialized form independent of insertion
/// (replay) order, which snapshot materialization relies on for
/// byte-identical output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    bookmarks: BTreeMap<String, Bookmark>,
    folders: BTreeMap<String, Folder>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation.
    ///
    /// Never fails for operations that passed [`Operation::validate`]:
    /// a field update targeting an unknown entity id is tolerated as a no-op
    /// (the entity may have been created on a fork this replica has not seen
    /// compacted) and logged, while a create materializes the entity.
    /// Applying the same operation twice leaves the document unchanged.
    pub fn apply(&mut self, op: &Operation) {
        let ts = op.logical_ts();
        let actor = op.actor_id.as_str();

        match &op.payload {
            FieldMutation::Create {
                entity_id, seed, ..
            } => match seed.kind() {
                EntityKind::Bookmark => {
                    if let Some(existing) = self.bookmarks.get_mut(entity_id) {
                        fold_bookmark_seed(existing, seed, ts, actor, op.created_at);
                    } else if let Some(bookmark) =
                        Bookmark::from_seed(entity_id, seed, ts, actor, op.created_at)
                    {
                        self.bookmarks.insert(entity_id.clone(), bookmark);
                    }
                }
                EntityKind::Folder => {
                    if let Some(existing) = self.folders.get_mut(entity_id) {
                        fold_folder_seed(existing, seed, ts, actor, op.created_at);
                    } else if let Some(folder) =
                        Folder::from_seed(entity_id, seed, ts, actor, op.created_at)
                    {
                        self.folders.insert(entity_id.clone(), folder);
                    }
                }
            },
            FieldMutation::SetField {
                entity_kind,
                entity_id,
                field,
                value,
                ..
            } => {
                let applied = match entity_kind {
                    EntityKind::Bookmark => self
                        .bookmarks
                        .get_mut(entity_id)
                        .map(|b| set_bookmark_field(b, *field, value, ts, actor, op.created_at)),
                    EntityKind::Folder => self
                        .folders
                        .get_mut(entity_id)
                        .map(|f| set_folder_field(f, *field, value, ts, actor, op.created_at)),
                };
                if applied.is_none() {
                    log::warn!(
                        "ignoring field update for unknown {} '{}'",
                        entity_kind,
                        entity_id
                    );
                }
            }
            FieldMutation::AddTag {
                entity_id, tag, ..
            } => match self.bookmarks.get_mut(entity_id) {
                Some(bookmark) => {
                    bookmark.tags.apply_add(tag, ts, actor);
                    bookmark.updated_at = bookmark.updated_at.max(op.created_at);
                }
                None => log::warn!("ignoring tag add for unknown bookmark '{}'", entity_id),
            },
            FieldMutation::RemoveTag {
                entity_id, tag, ..
            } => match self.bookmarks.get_mut(entity_id) {
                Some(bookmark) => {
                    bookmark.tags.apply_remove(tag, ts, actor);
                    bookmark.updated_at = bookmark.updated_at.max(op.created_at);
                }
                None => log::warn!("ignoring tag remove for unknown bookmark '{}'", entity_id),
            },
        }
    }

    // ==================== Read access ====================

    pub fn bookmark(&self, id: &str) -> Option<&Bookmark> {
        self.bookmarks.get(id)
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.get(id)
    }

    /// All bookmarks, tombstones included.
    pub fn bookmarks(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.values()
    }

    /// Non-deleted bookmarks.
    pub fn live_bookmarks(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.values().filter(|b| !b.is_deleted())
    }

    pub fn folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values()
    }

    pub fn live_folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values().filter(|f| !f.is_deleted())
    }

    /// Total entity count, tombstones included.
    pub fn entity_count(&self) -> u64 {
        (self.bookmarks.len() + self.folders.len()) as u64
    }

    /// Materialized path of a folder, derived by walking the parent chain
    /// ("/parent/child"). Advisory only: never used for identity or merge.
    /// Returns None for unknown folders; a parent cycle (possible after
    /// concurrent re-parenting) truncates at the first revisited node.
    pub fn folder_path(&self, id: &str) -> Option<String> {
        let mut segments = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        let mut cursor = Some(id.to_string());

        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                break;
            }
            let folder = self.folders.get(&current)?;
            segments.push(folder.title.value.clone());
            cursor = folder.parent_id.value.clone();
        }

        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    /// Tag name → reference count across non-deleted bookmarks. Always ≥ 0.
    pub fn tag_counts(&self) -> TagCounts {
        let mut counts = TagCounts::new();
        for bookmark in self.live_bookmarks() {
            for tag in bookmark.tags.live() {
                *counts.entry(tag.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Drop tombstoned entities whose delete is older than `cutoff_ms`.
    ///
    /// Only called from snapshot materialization; a tombstone inside the
    /// retention window stays mergeable against concurrent revives.
    pub fn purge_tombstones(&mut self, cutoff_ms: i64) {
        self.bookmarks
            .retain(|_, b| !(b.is_deleted() && b.deleted_at.is_some_and(|t| t < cutoff_ms)));
        self.folders
            .retain(|_, f| !(f.is_deleted() && f.deleted_at.is_some_and(|t| t < cutoff_ms)));
    }

    // ==================== Snapshot encoding ====================

    /// Canonical snapshot bytes. Deterministic for a given document state.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode snapshot bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Fold a create seed into an existing bookmark, field by field, under LWW.
fn fold_bookmark_seed(
    bookmark: &mut Bookmark,
    seed: &crate::op::EntitySeed,
    ts: u64,
    actor: &str,
    created_at: i64,
) {
    let crate::op::EntitySeed::Bookmark {
        url,
        title,
        description,
        notes,
        folder_id,
        favicon,
        pinned,
        tags,
    } = seed
    else {
        return;
    };

    bookmark.url.merge_write(url.clone(), ts, actor);
    bookmark.title.merge_write(title.clone(), ts, actor);
    bookmark
        .description
        .merge_write(description.clone(), ts, actor);
    bookmark.notes.merge_write(notes.clone(), ts, actor);
    bookmark.folder_id.merge_write(folder_id.clone(), ts, actor);
    bookmark.favicon.merge_write(favicon.clone(), ts, actor);
    bookmark.pinned.merge_write(*pinned, ts, actor);
    for tag in tags {
        bookmark.tags.apply_add(tag, ts, actor);
    }
    bookmark.created_at = bookmark.created_at.min(created_at);
    bookmark.updated_at = bookmark.updated_at.max(created_at);
}

/// Fold a create seed into an existing folder.
fn fold_folder_seed(
    folder: &mut Folder,
    seed: &crate::op::EntitySeed,
    ts: u64,
    actor: &str,
    created_at: i64,
) {
    let crate::op::EntitySeed::Folder { title, parent_id } = seed else {
        return;
    };
    folder.title.merge_write(title.clone(), ts, actor);
    folder.parent_id.merge_write(parent_id.clone(), ts, actor);
    folder.created_at = folder.created_at.min(created_at);
    folder.updated_at = folder.updated_at.max(created_at);
}

fn set_bookmark_field(
    bookmark: &mut Bookmark,
    field: FieldName,
    value: &FieldValue,
    ts: u64,
    actor: &str,
    created_at: i64,
) -> bool {
    let won = match (field, value) {
        (FieldName::Url, FieldValue::Text(v)) => bookmark.url.merge_write(v.clone(), ts, actor),
        (FieldName::Title, FieldValue::Text(v)) => {
            bookmark.title.merge_write(v.clone(), ts, actor)
        }
        (FieldName::Description, FieldValue::OptText(v)) => {
            bookmark.description.merge_write(v.clone(), ts, actor)
        }
        (FieldName::Notes, FieldValue::OptText(v)) => {
            bookmark.notes.merge_write(v.clone(), ts, actor)
        }
        (FieldName::Favicon, FieldValue::OptText(v)) => {
            bookmark.favicon.merge_write(v.clone(), ts, actor)
        }
        (FieldName::FolderId, FieldValue::EntityRef(v)) => {
            bookmark.folder_id.merge_write(v.clone(), ts, actor)
        }
        (FieldName::Pinned, FieldValue::Flag(v)) => bookmark.pinned.merge_write(*v, ts, actor),
        (FieldName::Deleted, FieldValue::Flag(v)) => {
            let won = bookmark.deleted.merge_write(*v, ts, actor);
            if won {
                // deleted_at always follows the winning write so replicas
                // agree on it regardless of application order
                bookmark.deleted_at = if *v { Some(created_at) } else { None };
            }
            won
        }
        // validate() rules this out for remote ops; local misuse is a no-op
        _ => return false,
    };
    // every observed touch moves updated_at, winning or not, so the value
    // is a commutative max and replicas agree on it in any replay order
    bookmark.updated_at = bookmark.updated_at.max(created_at);
    won
}

fn set_folder_field(
    folder: &mut Folder,
    field: FieldName,
    value: &FieldValue,
    ts: u64,
    actor: &str,
    created_at: i64,
) -> bool {
    let won = match (field, value) {
        (FieldName::Title, FieldValue::Text(v)) => folder.title.merge_write(v.clone(), ts, actor),
        (FieldName::ParentId, FieldValue::EntityRef(v)) => {
            folder.parent_id.merge_write(v.clone(), ts, actor)
        }
        (FieldName::Deleted, FieldValue::Flag(v)) => {
            let won = folder.deleted.merge_write(*v, ts, actor);
            if won {
                folder.deleted_at = if *v { Some(created_at) } else { None };
            }
            won
        }
        _ => return false,
    };
    folder.updated_at = folder.updated_at.max(created_at);
    won
}
