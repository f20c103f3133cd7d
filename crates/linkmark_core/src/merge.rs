//! Merge engine: fold acceptance-ordered operations onto a base document.
//!
//! Replay order is the log's acceptance order, never wall-clock arrival
//! order, so any two replicas that have seen the same operation set
//! converge to the identical document regardless of where or when they
//! replay it. Conflict resolution itself is per-field LWW / add-wins and
//! lives in [`crate::model::Document::apply`].

use crate::error::{Result, SyncError};
use crate::model::Document;
use crate::storage::{SnapshotRecord, StoredOperation};

/// Fold operations into a document, in the order given.
pub fn replay_into(doc: &mut Document, ops: &[StoredOperation]) {
    for stored in ops {
        doc.apply(&stored.operation);
    }
}

/// Fold operations onto a fresh copy of `base`.
pub fn replay(base: &Document, ops: &[StoredOperation]) -> Document {
    let mut doc = base.clone();
    replay_into(&mut doc, ops);
    doc
}

/// Materialize the canonical document from an optional snapshot plus the
/// operation tail accepted after it.
///
/// Deterministic and idempotent: the same `(base, ops)` input always yields
/// the same document and, via [`Document::to_bytes`], byte-identical
/// snapshot output, which snapshot verification relies on.
pub fn materialize(base: Option<&SnapshotRecord>, ops: &[StoredOperation]) -> Result<Document> {
    let mut doc = match base {
        Some(snap) => Document::from_bytes(&snap.data).map_err(|e| {
            SyncError::SnapshotMaterialization(format!(
                "snapshot {} undecodable: {}",
                snap.id, e
            ))
        })?,
        None => Document::new(),
    };
    replay_into(&mut doc, ops);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{EntityKind, EntitySeed, FieldMutation, FieldName, FieldValue, Operation};
    use crate::storage::StoredOperation;

    fn stored(id: i64, op: Operation) -> StoredOperation {
        StoredOperation {
            id,
            account_id: "acct".into(),
            operation: op,
            accepted_at: id,
        }
    }

    fn create(actor: &str, seq: u64, entity: &str, ts: u64) -> Operation {
        Operation::new(
            actor,
            seq,
            FieldMutation::Create {
                entity_id: entity.into(),
                seed: EntitySeed::Bookmark {
                    url: format!("https://{}.example", entity),
                    title: entity.to_uppercase(),
                    description: None,
                    notes: None,
                    folder_id: None,
                    favicon: None,
                    pinned: false,
                    tags: vec![],
                },
                logical_ts: ts,
            },
            ts as i64,
        )
    }

    fn set_title(actor: &str, seq: u64, entity: &str, title: &str, ts: u64) -> Operation {
        Operation::new(
            actor,
            seq,
            FieldMutation::SetField {
                entity_kind: EntityKind::Bookmark,
                entity_id: entity.into(),
                field: FieldName::Title,
                value: FieldValue::Text(title.into()),
                logical_ts: ts,
            },
            ts as i64,
        )
    }

    #[test]
    fn test_replay_applies_in_acceptance_order() {
        let ops = vec![
            stored(1, create("a", 1, "b1", 100)),
            stored(2, set_title("a", 2, "b1", "first", 110)),
            stored(3, set_title("b", 1, "b1", "second", 120)),
        ];
        let doc = replay(&Document::new(), &ops);
        assert_eq!(doc.bookmark("b1").unwrap().title.value, "second");
    }

    #[test]
    fn test_same_op_set_converges_across_interleavings() {
        // Ops from two actors on two entities; any causally consistent
        // interleaving must produce the same document.
        let c1 = stored(1, create("a", 1, "b1", 100));
        let c2 = stored(2, create("b", 1, "b2", 101));
        let e1 = stored(3, set_title("a", 2, "b1", "A1", 105));
        let e2 = stored(4, set_title("b", 2, "b2", "B1", 106));

        let orders: Vec<Vec<&StoredOperation>> = vec![
            vec![&c1, &c2, &e1, &e2],
            vec![&c2, &c1, &e2, &e1],
            vec![&c1, &e1, &c2, &e2],
            vec![&c2, &e2, &c1, &e1],
        ];

        let mut rendered = Vec::new();
        for order in orders {
            let mut doc = Document::new();
            for op in order {
                doc.apply(&op.operation);
            }
            rendered.push(doc.to_bytes().unwrap());
        }
        assert!(rendered.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_materialize_from_snapshot_equals_full_replay() {
        let ops = vec![
            stored(1, create("a", 1, "b1", 100)),
            stored(2, set_title("a", 2, "b1", "X", 110)),
            stored(3, set_title("b", 1, "b1", "Y", 150)),
        ];

        let full = materialize(None, &ops).unwrap();

        // snapshot after the first two ops, then replay the tail
        let base_doc = materialize(None, &ops[..2]).unwrap();
        let snap = SnapshotRecord {
            id: 1,
            account_id: "acct".into(),
            last_operation_id: 2,
            data: base_doc.to_bytes().unwrap(),
            entity_count: base_doc.entity_count(),
            size_bytes: 0,
            created_at: 0,
        };
        let from_snapshot = materialize(Some(&snap), &ops[2..]).unwrap();

        assert_eq!(
            full.to_bytes().unwrap(),
            from_snapshot.to_bytes().unwrap()
        );
    }

    #[test]
    fn test_materialize_rejects_corrupt_snapshot() {
        let snap = SnapshotRecord {
            id: 1,
            account_id: "acct".into(),
            last_operation_id: 1,
            data: b"not json".to_vec(),
            entity_count: 0,
            size_bytes: 0,
            created_at: 0,
        };
        assert!(matches!(
            materialize(Some(&snap), &[]),
            Err(SyncError::SnapshotMaterialization(_))
        ));
    }
}
