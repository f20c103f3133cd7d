//! Replicated entity types: LWW registers, tag sets, bookmarks and folders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::op::{ActorId, EntityId, EntitySeed, LogicalTimestamp};

/// A last-writer-wins register for one field.
///
/// A write wins iff its `(logical_ts, actor_id)` pair is lexicographically
/// greater than the register's current pair, which gives a deterministic
/// winner even when two actors mutate the same field at the same logical
/// instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register<T> {
    pub value: T,
    pub logical_ts: LogicalTimestamp,
    pub actor_id: ActorId,
}

impl<T> Register<T> {
    pub fn new(value: T, logical_ts: LogicalTimestamp, actor_id: &str) -> Self {
        Self {
            value,
            logical_ts,
            actor_id: actor_id.to_string(),
        }
    }

    /// Whether a write stamped `(logical_ts, actor_id)` beats the current one.
    pub fn loses_to(&self, logical_ts: LogicalTimestamp, actor_id: &str) -> bool {
        (logical_ts, actor_id) > (self.logical_ts, self.actor_id.as_str())
    }

    /// Fold in a write under the LWW rule. Returns true when the write won.
    pub fn merge_write(
        &mut self,
        value: T,
        logical_ts: LogicalTimestamp,
        actor_id: &str,
    ) -> bool {
        if self.loses_to(logical_ts, actor_id) {
            self.value = value;
            self.logical_ts = logical_ts;
            self.actor_id = actor_id.to_string();
            true
        } else {
            false
        }
    }
}

/// Per-element add/remove witness inside a [`TagSet`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Greatest observed add, as `(logical_ts, actor_id)`.
    pub added: Option<(LogicalTimestamp, ActorId)>,
    /// Greatest observed remove.
    pub removed: Option<(LogicalTimestamp, ActorId)>,
}

impl TagEntry {
    /// Add-wins membership: present unless a remove carries a strictly later
    /// logical timestamp than every observed add.
    pub fn is_present(&self) -> bool {
        match (&self.added, &self.removed) {
            (Some(add), Some(remove)) => add.0 >= remove.0,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Add-wins observed-remove set for bookmark tags.
///
/// Entries are retained (with their witnesses) even when removed, so a
/// later concurrent add resolves correctly; `BTreeMap` keeps serialization
/// deterministic for snapshot materialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSet {
    entries: BTreeMap<String, TagEntry>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in an add witness. Returns true if anything changed.
    pub fn apply_add(&mut self, tag: &str, logical_ts: LogicalTimestamp, actor_id: &str) -> bool {
        let entry = self.entries.entry(tag.to_string()).or_default();
        let candidate = (logical_ts, actor_id.to_string());
        match &entry.added {
            Some(current) if *current >= candidate => false,
            _ => {
                entry.added = Some(candidate);
                true
            }
        }
    }

    /// Fold in a remove witness. Returns true if anything changed.
    pub fn apply_remove(
        &mut self,
        tag: &str,
        logical_ts: LogicalTimestamp,
        actor_id: &str,
    ) -> bool {
        let entry = self.entries.entry(tag.to_string()).or_default();
        let candidate = (logical_ts, actor_id.to_string());
        match &entry.removed {
            Some(current) if *current >= candidate => false,
            _ => {
                entry.removed = Some(candidate);
                true
            }
        }
    }

    /// Whether `tag` is currently a member.
    pub fn contains(&self, tag: &str) -> bool {
        self.entries.get(tag).is_some_and(|e| e.is_present())
    }

    /// Live members, in lexicographic order.
    pub fn live(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_present())
            .map(|(tag, _)| tag.as_str())
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.live().next().is_none()
    }
}

/// One saved link.
///
/// `deleted = true` is a tombstone, not an erasure: the record is retained
/// (with notes and tags intact) for a bounded window so a concurrent edit
/// with a later timestamp can revive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: EntityId,
    pub url: Register<String>,
    pub title: Register<String>,
    pub description: Register<Option<String>>,
    pub notes: Register<Option<String>>,
    pub folder_id: Register<Option<EntityId>>,
    pub favicon: Register<Option<String>>,
    pub pinned: Register<bool>,
    pub tags: TagSet,
    pub deleted: Register<bool>,
    /// Wall-clock millis of the winning delete, None while live.
    pub deleted_at: Option<i64>,
    /// Wall-clock millis of the creating operation.
    pub created_at: i64,
    /// Wall-clock millis of the latest applied winning mutation.
    pub updated_at: i64,
}

impl Bookmark {
    /// Materialize a bookmark from a create seed.
    pub fn from_seed(
        id: &str,
        seed: &EntitySeed,
        logical_ts: LogicalTimestamp,
        actor_id: &str,
        created_at: i64,
    ) -> Option<Self> {
        let EntitySeed::Bookmark {
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
            return None;
        };

        let mut tag_set = TagSet::new();
        for tag in tags {
            tag_set.apply_add(tag, logical_ts, actor_id);
        }

        Some(Self {
            id: id.to_string(),
            url: Register::new(url.clone(), logical_ts, actor_id),
            title: Register::new(title.clone(), logical_ts, actor_id),
            description: Register::new(description.clone(), logical_ts, actor_id),
            notes: Register::new(notes.clone(), logical_ts, actor_id),
            folder_id: Register::new(folder_id.clone(), logical_ts, actor_id),
            favicon: Register::new(favicon.clone(), logical_ts, actor_id),
            pinned: Register::new(*pinned, logical_ts, actor_id),
            tags: tag_set,
            deleted: Register::new(false, logical_ts, actor_id),
            deleted_at: None,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.value
    }
}

/// Hierarchical container for bookmarks.
///
/// The materialized path is derived from the parent chain on read; it is
/// never merge-authoritative, and two folders may share a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: EntityId,
    pub title: Register<String>,
    pub parent_id: Register<Option<EntityId>>,
    pub deleted: Register<bool>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Folder {
    /// Materialize a folder from a create seed.
    pub fn from_seed(
        id: &str,
        seed: &EntitySeed,
        logical_ts: LogicalTimestamp,
        actor_id: &str,
        created_at: i64,
    ) -> Option<Self> {
        let EntitySeed::Folder { title, parent_id } = seed else {
            return None;
        };
        Some(Self {
            id: id.to_string(),
            title: Register::new(title.clone(), logical_ts, actor_id),
            parent_id: Register::new(parent_id.clone(), logical_ts, actor_id),
            deleted: Register::new(false, logical_ts, actor_id),
            deleted_at: None,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_later_ts_wins() {
        let mut reg = Register::new("a".to_string(), 10, "dev-1");
        assert!(reg.merge_write("b".to_string(), 11, "dev-1"));
        assert_eq!(reg.value, "b");
    }

    #[test]
    fn test_register_earlier_ts_loses() {
        let mut reg = Register::new("a".to_string(), 10, "dev-1");
        assert!(!reg.merge_write("b".to_string(), 9, "dev-2"));
        assert_eq!(reg.value, "a");
    }

    #[test]
    fn test_register_actor_breaks_ties() {
        let mut reg = Register::new("a".to_string(), 10, "dev-1");
        assert!(reg.merge_write("b".to_string(), 10, "dev-2"));
        assert_eq!(reg.value, "b");
        // dev-1 < dev-2, so the reverse write loses
        assert!(!reg.merge_write("c".to_string(), 10, "dev-1"));
        assert_eq!(reg.value, "b");
    }

    #[test]
    fn test_register_equal_write_is_noop() {
        let mut reg = Register::new("a".to_string(), 10, "dev-1");
        assert!(!reg.merge_write("a".to_string(), 10, "dev-1"));
    }

    #[test]
    fn test_tag_set_add_then_remove() {
        let mut tags = TagSet::new();
        tags.apply_add("rust", 5, "dev-1");
        assert!(tags.contains("rust"));
        tags.apply_remove("rust", 6, "dev-2");
        assert!(!tags.contains("rust"));
    }

    #[test]
    fn test_tag_set_add_wins_on_tie() {
        let mut tags = TagSet::new();
        tags.apply_add("rust", 5, "dev-1");
        tags.apply_remove("rust", 5, "dev-2");
        assert!(tags.contains("rust"));
    }

    #[test]
    fn test_tag_set_concurrent_add_revives() {
        let mut tags = TagSet::new();
        tags.apply_add("rust", 5, "dev-1");
        tags.apply_remove("rust", 6, "dev-1");
        assert!(!tags.contains("rust"));
        tags.apply_add("rust", 7, "dev-2");
        assert!(tags.contains("rust"));
    }

    #[test]
    fn test_tag_set_application_order_is_irrelevant() {
        let mut forward = TagSet::new();
        forward.apply_add("js", 3, "a");
        forward.apply_remove("js", 4, "b");
        forward.apply_add("js", 4, "c");

        let mut backward = TagSet::new();
        backward.apply_add("js", 4, "c");
        backward.apply_remove("js", 4, "b");
        backward.apply_add("js", 3, "a");

        assert_eq!(forward, backward);
        assert!(forward.contains("js"));
    }
}
