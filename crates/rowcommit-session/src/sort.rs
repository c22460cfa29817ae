//! Operation ordering.
//!
//! Operations run in four bands: deletes that free a key a new row is about
//! to take, then inserts, updates, and the remaining deletes. The first band
//! also carries the deletes of every table that references a freed row's
//! table, so children still go before their parent. Inside a band tables
//! follow the dependency graph, parents first for writes and children first
//! for deletes; tables the graph leaves unordered keep their incoming order.
//! Rows of a self-referencing table are further ordered so that a parent
//! row is written before the rows pointing at it.

use crate::cell::CellArena;
use crate::operation::{Atom, IdentityKey, OperationKind, RowOperation};
use rowcommit_core::{DependencyGraph, EntityResolver, JoinSegment, Value};
use std::collections::{HashMap, HashSet};

/// Band of an operation; lower runs first.
fn rank(
    op: &RowOperation,
    recreated: &HashSet<IdentityKey>,
    early: &HashSet<&'static str>,
    cells: &CellArena,
) -> u8 {
    match op.kind {
        OperationKind::Delete => {
            if frees_key(op, recreated, cells) || early.contains(op.table) {
                0
            } else {
                3
            }
        }
        OperationKind::Insert => 1,
        OperationKind::Update => 2,
    }
}

fn frees_key(op: &RowOperation, recreated: &HashSet<IdentityKey>, cells: &CellArena) -> bool {
    op.is_delete()
        && op
            .identity
            .effective(cells)
            .is_some_and(|key| recreated.contains(&key))
}

/// Tables whose deletes join a key-freeing delete in the first band: every
/// table referencing a freed table, directly or through other tables.
fn dependent_tables(
    freed: &HashSet<&'static str>,
    graph: &dyn DependencyGraph,
    mappings: &EntityResolver,
) -> HashSet<&'static str> {
    let mut tables: HashSet<&'static str> = freed
        .iter()
        .copied()
        .filter(|table| graph.is_self_referencing(table))
        .collect();
    let mut frontier: Vec<&'static str> = freed.iter().copied().collect();
    let mut visited: HashSet<&'static str> = freed.clone();
    while let Some(parent) = frontier.pop() {
        for segment in mappings.segments() {
            let child = segment.dependent_table();
            if segment.parent_table() != parent || child == parent {
                continue;
            }
            tables.insert(child);
            if visited.insert(child) {
                frontier.push(child);
            }
        }
    }
    tables
}

/// Order operations for execution.
#[tracing::instrument(level = "debug", skip_all, fields(operations = ops.len()))]
pub(crate) fn sort(
    ops: Vec<RowOperation>,
    graph: &dyn DependencyGraph,
    mappings: &EntityResolver,
    cells: &CellArena,
) -> Vec<RowOperation> {
    let recreated: HashSet<IdentityKey> = ops
        .iter()
        .filter(|op| op.is_insert() && !op.suppressed)
        .filter_map(|op| op.identity.effective(cells))
        .filter(IdentityKey::is_literal)
        .collect();
    let freed: HashSet<&'static str> = ops
        .iter()
        .filter(|op| frees_key(op, &recreated, cells))
        .map(|op| op.table)
        .collect();
    let early = if freed.is_empty() {
        HashSet::new()
    } else {
        let early = dependent_tables(&freed, graph, mappings);
        tracing::debug!(freed = ?freed, dependents = ?early, "Deletes freeing recreated keys run first");
        early
    };

    let mut first_seen: HashMap<&'static str, usize> = HashMap::new();
    for op in &ops {
        let next = first_seen.len();
        first_seen.entry(op.table).or_insert(next);
    }

    let mut ranked: Vec<(u8, RowOperation)> = ops
        .into_iter()
        .map(|op| (rank(&op, &recreated, &early, cells), op))
        .collect();
    ranked.sort_by(|(ra, a), (rb, b)| {
        ra.cmp(rb)
            .then_with(|| {
                let order = graph.compare(a.table, b.table);
                if *ra == 0 || *ra == 3 { order.reverse() } else { order }
            })
            .then_with(|| first_seen[a.table].cmp(&first_seen[b.table]))
    });

    let mut sorted = Vec::with_capacity(ranked.len());
    let mut run: Vec<RowOperation> = Vec::new();
    let mut run_rank = 0;
    for (rank, op) in ranked {
        if run.first().is_some_and(|first| first.table != op.table || run_rank != rank) {
            flush_run(&mut sorted, std::mem::take(&mut run), graph, mappings, cells);
        }
        run_rank = rank;
        run.push(op);
    }
    flush_run(&mut sorted, run, graph, mappings, cells);
    sorted
}

fn flush_run(
    sorted: &mut Vec<RowOperation>,
    run: Vec<RowOperation>,
    graph: &dyn DependencyGraph,
    mappings: &EntityResolver,
    cells: &CellArena,
) {
    let Some(first) = run.first() else {
        return;
    };
    let segment = if run.len() > 1 && graph.is_self_referencing(first.table) {
        mappings.reflexive_segment(first.table)
    } else {
        None
    };
    match segment {
        Some(segment) => sorted.extend(order_hierarchy(run, segment, cells)),
        None => sorted.extend(run),
    }
}

/// Atoms of the columns a child row's foreign key points at.
fn row_key(op: &RowOperation, segment: &JoinSegment, cells: &CellArena) -> Option<Vec<Atom>> {
    segment
        .fk_pairs()
        .map(|(_, referenced)| {
            op.identity
                .key
                .get(referenced)
                .map(|v| v.atom(cells))
                .or_else(|| op.value(referenced).map(|v| v.atom(cells)))
                .or_else(|| op.committed.get(referenced).cloned().map(Atom::Literal))
        })
        .collect()
}

/// Atoms of a row's foreign key to its parent, `None` for a root row.
fn parent_key(op: &RowOperation, segment: &JoinSegment, cells: &CellArena) -> Option<Vec<Atom>> {
    let atoms: Option<Vec<Atom>> = segment
        .fk_pairs()
        .map(|(fk, _)| {
            let current = if op.is_delete() { None } else { op.value(fk) };
            current
                .map(|v| v.atom(cells))
                .or_else(|| op.committed.get(fk).cloned().map(Atom::Literal))
        })
        .collect();
    atoms.filter(|atoms| !atoms.iter().any(|a| *a == Atom::Literal(Value::Null)))
}

/// Stable topological order of one table's rows along its reflexive
/// relationship: ancestors first, or descendants first for deletes.
///
/// Rows caught in a cycle keep their incoming order.
fn order_hierarchy(
    run: Vec<RowOperation>,
    segment: &JoinSegment,
    cells: &CellArena,
) -> Vec<RowOperation> {
    let keys: Vec<_> = run.iter().map(|op| row_key(op, segment, cells)).collect();
    let parents: Vec<_> = run.iter().map(|op| parent_key(op, segment, cells)).collect();
    let descendants_first = run.iter().all(RowOperation::is_delete);

    // waits[i]: rows that must be placed before row i
    let mut waits: Vec<Vec<usize>> = vec![Vec::new(); run.len()];
    for (child, parent) in parents.iter().enumerate() {
        let Some(parent) = parent else { continue };
        for (row, key) in keys.iter().enumerate() {
            if row == child || key.as_ref() != Some(parent) {
                continue;
            }
            if descendants_first {
                waits[row].push(child);
            } else {
                waits[child].push(row);
            }
        }
    }

    let mut placed = vec![false; run.len()];
    let mut order = Vec::with_capacity(run.len());
    while order.len() < run.len() {
        let next = (0..run.len()).find(|&i| !placed[i] && waits[i].iter().all(|&w| placed[w]));
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                tracing::warn!(
                    table = run[0].table,
                    remaining = run.len() - order.len(),
                    "Cycle among self-referencing rows; keeping recorded order"
                );
                order.extend((0..run.len()).filter(|&i| !placed[i]));
                break;
            }
        }
    }

    let mut slots: Vec<Option<RowOperation>> = run.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}
