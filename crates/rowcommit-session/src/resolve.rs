//! Key resolution for new rows.
//!
//! After sorting, every insert whose key is still pending gets a value from,
//! in order: a user-assigned meaningful key, the store (auto-increment
//! columns, read back at execution), a parent row it is propagated from, or
//! the key generator. [`validate`] then checks the ordered list before any
//! statement runs.

use crate::cell::{CellArena, CellId, Deref};
use crate::collaborators::KeyGenerator;
use crate::operation::{ColumnValue, RowOperation};
use rowcommit_core::{EntityResolver, Error, GraphShapeError, KeyError, Result, TableInfo};
use std::collections::HashSet;

fn key_error(op: &RowOperation, column: &'static str, message: impl Into<String>) -> KeyError {
    KeyError {
        table: op.table,
        column: Some(column),
        object: op.owner.clone(),
        message: message.into(),
    }
}

fn table_info<'a>(mappings: &'a EntityResolver, op: &RowOperation) -> Result<&'a TableInfo> {
    mappings.table(op.table).ok_or_else(|| {
        Error::UnsupportedGraphShape(GraphShapeError::new(
            op.owner.as_ref(),
            format!("table '{}' is not mapped", op.table),
        ))
    })
}

/// The cell a column of the operation's own identity was created with, if
/// it is still the root of its chain and pending.
fn own_pending(value: &ColumnValue, cells: &CellArena) -> Option<CellId> {
    match value {
        ColumnValue::Cell(id) if cells.deref(*id) == Deref::Pending(*id) => Some(*id),
        _ => None,
    }
}

/// Resolve the keys of every pending insert.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn resolve(
    ops: &[RowOperation],
    mappings: &EntityResolver,
    cells: &mut CellArena,
    keys: &mut dyn KeyGenerator,
) -> Result<()> {
    let mut generated_total = 0usize;
    for op in ops.iter().filter(|op| op.is_insert()) {
        if !op.identity.is_temporary(cells) {
            continue;
        }
        let table = table_info(mappings, op)?;
        let mut generated = 0usize;

        for (&column, value) in &op.identity.key {
            let Deref::Pending(root) = value.deref(cells) else {
                continue;
            };

            if let Some(ColumnValue::Literal(assigned)) = op.value(column) {
                if assigned.is_assigned() {
                    cells.resolve(root, assigned.clone());
                    continue;
                }
            }

            let Some(own) = own_pending(value, cells) else {
                // chained to a parent row's key
                continue;
            };
            if mappings.is_propagated(op.table, column) {
                return Err(Error::UnresolvableKey(key_error(
                    op,
                    column,
                    "propagated key column has no source value",
                )));
            }

            generated += 1;
            if generated > 1 {
                return Err(Error::UnresolvableKey(key_error(
                    op,
                    column,
                    "more than one key column needs a generated value",
                )));
            }
            if table.key_column(column).is_some_and(|k| k.auto_increment) {
                tracing::trace!(table = op.table, column = column, "Key generated by store");
                continue;
            }

            let value = keys.generate(op.table, column).map_err(|e| {
                Error::Execution(e.with_context(op.table, op.owner.as_ref()))
            })?;
            tracing::trace!(table = op.table, column = column, value = %value, "Generated key");
            cells.resolve(own, value);
            generated_total += 1;
        }
    }
    tracing::debug!(generated = generated_total, "Resolved row keys");
    Ok(())
}

/// Check that every value an executable operation reads will be known by
/// the time it runs.
///
/// Pending values are allowed only when an earlier insert produces them or,
/// for an insert's own auto-increment key, when the store does.
pub(crate) fn validate(
    ops: &[RowOperation],
    mappings: &EntityResolver,
    cells: &CellArena,
) -> Result<()> {
    let mut produced: HashSet<CellId> = HashSet::new();
    for op in ops.iter().filter(|op| op.is_executable()) {
        let table = table_info(mappings, op)?;
        let mut own = Vec::new();

        for (&column, value) in &op.identity.key {
            let Deref::Pending(root) = value.deref(cells) else {
                continue;
            };
            let store_generated = op.is_insert()
                && own_pending(value, cells).is_some()
                && table.key_column(column).is_some_and(|k| k.auto_increment);
            if store_generated {
                own.push(root);
            } else if !produced.contains(&root) {
                return Err(Error::MissingPrimaryKey(key_error(
                    op,
                    column,
                    "key is still temporary at execution",
                )));
            }
        }

        for (&column, write) in &op.values {
            if let Deref::Pending(root) = write.value.deref(cells) {
                if !produced.contains(&root) && !own.contains(&root) {
                    return Err(Error::MissingPrimaryKey(key_error(
                        op,
                        column,
                        "referenced key is never produced",
                    )));
                }
            }
        }
        produced.extend(own);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoKeyGenerator, SequenceKeyGenerator};
    use crate::operation::{ChangeIdentity, OperationKind};
    use rowcommit_core::{
        EntityMapping, ErrorKind, ExecutionErrorKind, JoinSegment, ObjectId, RelationshipInfo,
        TableInfo, Value,
    };

    fn resolver() -> EntityResolver {
        EntityResolver::new()
            .with_table(TableInfo::new("artists").generated_key("id"))
            .with_table(TableInfo::new("tickets").key("id"))
            .with_table(TableInfo::new("seats").key("hall").key("number"))
            .with_table(TableInfo::new("artist_info").key("artist_id"))
            .with_entity(EntityMapping::new("Artist", "artists").relationship(
                RelationshipInfo::new(
                    "info",
                    "Info",
                    JoinSegment::to_dependent_pk("artists", "id", "artist_info", "artist_id"),
                ),
            ))
            .with_entity(EntityMapping::new("Ticket", "tickets"))
            .with_entity(EntityMapping::new("Seat", "seats"))
            .with_entity(EntityMapping::new("Info", "artist_info"))
    }

    fn pending_insert(cells: &mut CellArena, table: &'static str, columns: &[&'static str]) -> RowOperation {
        let mut identity = ChangeIdentity::new(table);
        for column in columns {
            identity
                .key
                .insert(*column, ColumnValue::Cell(cells.pending_row(table, *column)));
        }
        RowOperation::new(OperationKind::Insert, identity, Some(ObjectId::temporary("Row", 1)))
    }

    #[test]
    fn test_generator_fills_plain_key() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let op = pending_insert(&mut cells, "tickets", &["id"]);
        let mut keys = SequenceKeyGenerator::starting_at(100);

        resolve(std::slice::from_ref(&op), &mappings, &mut cells, &mut keys).unwrap();
        assert_eq!(
            op.identity.resolved(&cells),
            Some(vec![("id", Value::BigInt(100))])
        );
    }

    #[test]
    fn test_auto_increment_left_to_store() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let op = pending_insert(&mut cells, "artists", &["id"]);

        resolve(std::slice::from_ref(&op), &mappings, &mut cells, &mut NoKeyGenerator).unwrap();
        assert!(op.identity.is_temporary(&cells));
        validate(std::slice::from_ref(&op), &mappings, &cells).unwrap();
    }

    #[test]
    fn test_assigned_value_resolves_key() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let mut op = pending_insert(&mut cells, "tickets", &["id"]);
        op.write("id", Value::BigInt(42).into(), 1);

        resolve(std::slice::from_ref(&op), &mappings, &mut cells, &mut NoKeyGenerator).unwrap();
        assert_eq!(
            op.identity.resolved(&cells),
            Some(vec![("id", Value::BigInt(42))])
        );
    }

    #[test]
    fn test_second_generated_column_is_unresolvable() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let op = pending_insert(&mut cells, "seats", &["hall", "number"]);
        let mut keys = SequenceKeyGenerator::new();

        let err = resolve(&[op], &mappings, &mut cells, &mut keys).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvableKey);
    }

    #[test]
    fn test_propagated_key_without_source_is_unresolvable() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let op = pending_insert(&mut cells, "artist_info", &["artist_id"]);
        let mut keys = SequenceKeyGenerator::new();

        let err = resolve(&[op], &mappings, &mut cells, &mut keys).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvableKey);
    }

    #[test]
    fn test_generator_failure_is_execution_error() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let op = pending_insert(&mut cells, "tickets", &["id"]);

        let err = resolve(&[op], &mappings, &mut cells, &mut NoKeyGenerator).unwrap_err();
        match err {
            Error::Execution(e) => {
                assert_eq!(e.kind, ExecutionErrorKind::KeyGeneration);
                assert_eq!(e.table, Some("tickets"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_chained_key_validates_after_parent() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let parent = pending_insert(&mut cells, "artists", &["id"]);
        let child = pending_insert(&mut cells, "artist_info", &["artist_id"]);
        let (ColumnValue::Cell(parent_key), ColumnValue::Cell(child_key)) =
            (&parent.identity.key["id"], &child.identity.key["artist_id"])
        else {
            panic!("keys should be pending");
        };
        cells.bind(*child_key, *parent_key);

        let ordered = vec![parent.clone(), child.clone()];
        resolve(&ordered, &mappings, &mut cells, &mut NoKeyGenerator).unwrap();
        validate(&ordered, &mappings, &cells).unwrap();

        let err = validate(&[child, parent], &mappings, &cells).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingPrimaryKey);
    }

    #[test]
    fn test_pending_update_qualifier_is_missing_key() {
        let mappings = resolver();
        let mut cells = CellArena::new();
        let mut op = pending_insert(&mut cells, "tickets", &["id"]);
        op.kind = OperationKind::Update;
        op.write("note", Value::from("x").into(), 1);

        let err = validate(&[op], &mappings, &cells).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingPrimaryKey);
    }
}
