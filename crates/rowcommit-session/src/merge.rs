//! Collapsing operations on the same row.
//!
//! Several diffs, or several arcs of one diff, can each produce an
//! operation for the same physical row. Operations owned by the same object
//! whose effective identities match are folded into one, keeping the
//! position of the first.

use crate::cell::{CellArena, Deref};
use crate::operation::{IdentityKey, OperationKind, RowOperation};
use indexmap::IndexMap;
use indexmap::map::Entry;
use rowcommit_core::ObjectId;

/// Merge operations that target the same row.
///
/// Running the result through `merge` again changes nothing.
#[tracing::instrument(level = "debug", skip_all, fields(operations = ops.len()))]
pub(crate) fn merge(ops: Vec<RowOperation>, cells: &CellArena) -> Vec<RowOperation> {
    let before = ops.len();
    let mut merged: Vec<RowOperation> = Vec::with_capacity(before);
    let mut positions: IndexMap<(IdentityKey, Option<ObjectId>), usize> = IndexMap::new();

    for op in ops {
        let Some(identity) = op.identity.effective(cells) else {
            merged.push(op);
            continue;
        };
        match positions.entry((identity, op.owner.clone())) {
            Entry::Occupied(slot) => merge_pair(&mut merged[*slot.get()], op, cells),
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(op);
            }
        }
    }

    if merged.len() < before {
        tracing::debug!(
            before = before,
            after = merged.len(),
            suppressed = merged.iter().filter(|op| op.suppressed).count(),
            "Merged row operations"
        );
    }
    merged
}

/// `(has insert, has delete)`; a suppressed pair carries both.
fn kind_flags(op: &RowOperation) -> (bool, bool) {
    (
        op.is_insert() || op.suppressed,
        op.is_delete() || op.suppressed,
    )
}

/// Fold `other` into `into`.
pub(crate) fn merge_pair(into: &mut RowOperation, other: RowOperation, cells: &CellArena) {
    let (a_insert, a_delete) = kind_flags(into);
    let (b_insert, b_delete) = kind_flags(&other);
    let (insert, delete) = (a_insert || b_insert, a_delete || b_delete);

    into.suppressed = insert && delete;
    into.kind = if insert {
        OperationKind::Insert
    } else if delete {
        OperationKind::Delete
    } else {
        OperationKind::Update
    };
    if into.suppressed {
        tracing::trace!(row = %into.describe(), "Insert and delete of one row cancel out");
    }

    for (column, write) in other.values {
        match into.values.get_mut(column) {
            Some(existing) if write.supersedes(existing) => *existing = write,
            Some(_) => {}
            None => {
                into.values.insert(column, write);
            }
        }
    }
    // lock and committed values come from the earliest diff
    let other_first = other.origin < into.origin;
    for (column, value) in other.locks {
        match into.locks.entry(column) {
            Entry::Occupied(mut slot) if other_first => {
                slot.insert(value);
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
    for (column, value) in other.committed {
        match into.committed.entry(column) {
            Entry::Occupied(mut slot) if other_first => {
                slot.insert(value);
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
    into.origin = into.origin.min(other.origin);

    for (column, value) in other.identity.key {
        let Some(existing) = into.identity.key.get_mut(column) else {
            continue;
        };
        let pending = matches!(existing.deref(cells), Deref::Pending(_));
        if pending && matches!(value.deref(cells), Deref::Resolved(_)) {
            *existing = value;
        }
    }

    if into.join.is_none() {
        into.join = other.join;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ChangeIdentity, ColumnValue};
    use rowcommit_core::Value;

    fn employee(kind: OperationKind) -> RowOperation {
        RowOperation::new(
            kind,
            ChangeIdentity::literal("employees", [("id", Value::BigInt(1))]),
            Some(ObjectId::single("Employee", "id", 1i64)),
        )
    }

    #[test]
    fn test_updates_collapse_and_later_write_wins() {
        let cells = CellArena::new();
        let mut first = employee(OperationKind::Update);
        first.write("salary", Value::BigInt(120).into(), 1);
        first.locks.insert("version", Value::BigInt(3));
        let mut second = employee(OperationKind::Update);
        second.write("salary", Value::BigInt(150).into(), 2);
        second.write("title", Value::from("Lead").into(), 3);
        second.locks.insert("version", Value::BigInt(4));

        let merged = merge(vec![first, second], &cells);
        assert_eq!(merged.len(), 1);
        let op = &merged[0];
        assert!(op.is_update());
        assert_eq!(op.value("salary"), Some(&ColumnValue::Literal(Value::BigInt(150))));
        assert!(op.value("title").is_some());
        assert_eq!(op.locks["version"], Value::BigInt(3));
    }

    #[test]
    fn test_earliest_lock_value_wins_in_any_order() {
        let cells = CellArena::new();
        let mut early = employee(OperationKind::Update);
        early.origin = 1;
        early.locks.insert("version", Value::BigInt(3));
        early.committed.insert("version", Value::BigInt(3));
        let mut late = employee(OperationKind::Update);
        late.origin = 5;
        late.locks.insert("version", Value::BigInt(4));
        late.committed.insert("version", Value::BigInt(4));

        for ops in [vec![early.clone(), late.clone()], vec![late, early]] {
            let merged = merge(ops, &cells);
            assert_eq!(merged.len(), 1);
            assert_eq!(merged[0].locks["version"], Value::BigInt(3));
            assert_eq!(merged[0].committed["version"], Value::BigInt(3));
            assert_eq!(merged[0].origin, 1);
        }
    }

    #[test]
    fn test_insert_and_delete_suppress() {
        let cells = CellArena::new();
        let merged = merge(
            vec![employee(OperationKind::Insert), employee(OperationKind::Delete)],
            &cells,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].suppressed);
        assert!(!merged[0].is_executable());

        // a later update does not revive the row
        let again = merge(
            vec![merged[0].clone(), employee(OperationKind::Update)],
            &cells,
        );
        assert!(again[0].suppressed);
    }

    #[test]
    fn test_delete_absorbs_update() {
        let cells = CellArena::new();
        let merged = merge(
            vec![employee(OperationKind::Update), employee(OperationKind::Delete)],
            &cells,
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_delete());
    }

    #[test]
    fn test_different_owners_stay_apart() {
        let cells = CellArena::new();
        let mut recreated = employee(OperationKind::Insert);
        recreated.owner = Some(ObjectId::temporary("Employee", 7));
        let merged = merge(vec![employee(OperationKind::Delete), recreated], &cells);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].is_delete());
        assert!(merged[1].is_insert());
    }

    #[test]
    fn test_keyless_rows_never_merge() {
        let cells = CellArena::new();
        let row = || RowOperation::new(OperationKind::Insert, ChangeIdentity::new("audit_log"), None);
        assert_eq!(merge(vec![row(), row()], &cells).len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let cells = CellArena::new();
        let mut a = employee(OperationKind::Update);
        a.write("salary", Value::BigInt(1).into(), 1);
        let mut b = employee(OperationKind::Update);
        b.write("salary", Value::BigInt(2).into(), 2);
        let once = merge(vec![a, b], &cells);
        let twice = merge(once.clone(), &cells);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_literal_identity_replaces_cell() {
        let mut cells = CellArena::new();
        let pending = cells.pending_row("artist_info", "artist_id");
        let owner = ObjectId::temporary("Artist", 1);

        let mut identity = ChangeIdentity::new("artist_info");
        identity.key.insert("artist_id", ColumnValue::Cell(pending));
        let mut into = RowOperation::new(OperationKind::Insert, identity, Some(owner.clone()));

        let literal = ChangeIdentity::literal("artist_info", [("artist_id", Value::BigInt(5))]);
        merge_pair(
            &mut into,
            RowOperation::new(OperationKind::Update, literal, Some(owner)),
            &cells,
        );
        assert_eq!(
            into.identity.key["artist_id"],
            ColumnValue::Literal(Value::BigInt(5))
        );
        assert!(into.is_insert());
    }
}
