//! Post-execution bookkeeping.
//!
//! Once every statement ran, new objects are repointed to their permanent
//! ids, key values are written back, join rows are recorded for later
//! flushes and the snapshot cache learns which rows changed.

use crate::cell::CellArena;
use crate::collaborators::{JoinPathIndex, JoinRowRecord, ObjectGraph, SnapshotCache};
use crate::execute::ExecutedRow;
use crate::operation::{JoinArc, OperationKind, RowOperation};
use indexmap::IndexMap;
use rowcommit_core::{
    EntityMapping, EntityResolver, Error, GraphShapeError, KeyError, ObjectId, ReplacementMapping,
    Result, RowSnapshot, Value,
};

/// Collaborators the postprocessor writes to.
pub(crate) struct Sinks<'s> {
    pub join_paths: &'s mut dyn JoinPathIndex,
    pub objects: &'s mut dyn ObjectGraph,
    pub snapshots: &'s mut dyn SnapshotCache,
}

fn entity_of<'m>(mappings: &'m EntityResolver, object: &ObjectId) -> Result<&'m EntityMapping> {
    mappings.entity(object.entity()).ok_or_else(|| {
        Error::UnsupportedGraphShape(GraphShapeError::new(
            Some(object),
            format!("entity '{}' is not mapped", object.entity()),
        ))
    })
}

/// Final key of an executed primary row, in key column order.
fn final_key(
    op: &RowOperation,
    row: &ExecutedRow,
    cells: &CellArena,
) -> Result<Vec<(&'static str, Value)>> {
    op.identity
        .key
        .iter()
        .map(|(&column, value)| {
            let written = match op.kind {
                OperationKind::Update => row.columns.get(column),
                _ => None,
            };
            written
                .or_else(|| value.deref(cells).value())
                .or_else(|| row.columns.get(column))
                .map(|v| (column, v.clone()))
                .ok_or_else(|| {
                    Error::MissingPrimaryKey(KeyError {
                        table: op.table,
                        column: Some(column),
                        object: op.owner.clone(),
                        message: "key unresolved after execution".to_string(),
                    })
                })
        })
        .collect()
}

/// Apply the results of an executed flush.
#[tracing::instrument(level = "debug", skip_all, fields(executed = executed.len()))]
pub(crate) fn postprocess(
    ops: &[RowOperation],
    executed: &[ExecutedRow],
    cells: &CellArena,
    mappings: &EntityResolver,
    sinks: Sinks<'_>,
) -> Result<ReplacementMapping> {
    let mut replacements = ReplacementMapping::new();
    let mut updated: Vec<(ObjectId, RowSnapshot)> = Vec::new();
    let mut deleted: Vec<ObjectId> = Vec::new();
    let mut join_rows: IndexMap<(JoinArc, OperationKind), Vec<(&'static str, RowSnapshot)>> =
        IndexMap::new();

    for row in executed {
        let op = &ops[row.index];

        if let Some(arc) = &op.join {
            let key = op
                .identity
                .resolved(cells)
                .map(|key| key.into_iter().collect::<RowSnapshot>())
                .unwrap_or_else(|| row.columns.clone());
            join_rows
                .entry((arc.clone(), op.kind))
                .or_default()
                .push((op.table, key));
            continue;
        }

        let Some(owner) = &op.owner else {
            continue;
        };
        let entity = entity_of(mappings, owner)?;
        if entity.table != op.table {
            // secondary rows follow their primary row
            continue;
        }

        if op.is_delete() {
            deleted.push(owner.clone());
            continue;
        }

        let key = final_key(op, row, cells)?;
        let final_id = ObjectId::permanent(owner.entity(), key.clone());
        if final_id != *owner {
            tracing::debug!(from = %owner, to = %final_id, "Replacing object identity");
            sinks.objects.repoint(owner, &final_id);
            replacements.record(owner.clone(), final_id.clone());
        }

        for (column, value) in &key {
            let supplied = op.value(column).is_some_and(|v| v.is_literal());
            if supplied {
                continue;
            }
            if let Some(attr) = entity.attribute_for_column(column) {
                sinks.objects.write_back(&final_id, attr.name, value);
            }
        }

        let mut snapshot = op.committed.clone();
        for (column, value) in &row.columns {
            snapshot.insert(*column, value.clone());
        }
        for (column, value) in key {
            snapshot.insert(column, value);
        }
        updated.push((final_id, snapshot));
    }

    let endpoint = |id: &ObjectId| replacements.get(id).cloned().unwrap_or_else(|| id.clone());
    for ((arc, kind), rows) in join_rows {
        let record = JoinRowRecord {
            source: endpoint(&arc.source),
            relationship: arc.relationship,
            target: endpoint(&arc.target),
            rows,
        };
        let reverse = mappings
            .entity(record.source.entity())
            .and_then(|e| e.find_relationship(record.relationship))
            .and_then(|r| r.reverse);
        let mirror = reverse.map(|reverse| JoinRowRecord {
            source: record.target.clone(),
            relationship: reverse,
            target: record.source.clone(),
            rows: record.rows.clone(),
        });

        for record in std::iter::once(record).chain(mirror) {
            match kind {
                OperationKind::Insert => sinks.join_paths.register(record),
                OperationKind::Delete => sinks.join_paths.unregister(&record),
                OperationKind::Update => {}
            }
        }
    }

    tracing::debug!(
        replaced = replacements.len(),
        updated = updated.len(),
        deleted = deleted.len(),
        "Invalidating snapshots"
    );
    sinks.snapshots.invalidate(&updated, &deleted);
    Ok(replacements)
}
