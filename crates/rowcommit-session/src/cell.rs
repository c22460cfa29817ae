//! Lazily resolved key values.
//!
//! A new row's key is often unknown while the flush is being planned: the
//! store generates it on insert, or it is copied from a parent row that is
//! itself still waiting for a key. Such values are represented by cells in a
//! per-flush [`CellArena`]. A cell is either resolved to a literal or pending
//! on a producer: the row column that will produce the value, or another
//! cell it is derived from.
//!
//! Derivation chains always point at cells created earlier, so following a
//! chain terminates.

use rowcommit_core::Value;
use serde::Serialize;
use std::fmt;

/// Handle to a cell in a [`CellArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellId(usize);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a pending cell is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Producer {
    /// The key column of a row that has not been written yet.
    Row {
        table: &'static str,
        column: &'static str,
    },
    /// Another cell whose value this one copies.
    Cell(CellId),
}

/// A two-state key value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCell {
    Pending(Producer),
    Resolved(Value),
}

/// Result of following a cell's derivation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deref<'a> {
    Resolved(&'a Value),
    /// The chain ends in this still-pending root cell.
    Pending(CellId),
}

impl<'a> Deref<'a> {
    pub fn value(self) -> Option<&'a Value> {
        match self {
            Deref::Resolved(v) => Some(v),
            Deref::Pending(_) => None,
        }
    }
}

/// Per-flush storage for key cells.
#[derive(Debug, Default)]
pub struct CellArena {
    cells: Vec<KeyCell>,
}

impl CellArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell produced by writing `table.column`.
    pub fn pending_row(&mut self, table: &'static str, column: &'static str) -> CellId {
        self.push(KeyCell::Pending(Producer::Row { table, column }))
    }

    /// A cell that copies `from` once it resolves.
    pub fn derived(&mut self, from: CellId) -> CellId {
        self.push(KeyCell::Pending(Producer::Cell(from)))
    }

    fn push(&mut self, cell: KeyCell) -> CellId {
        self.cells.push(cell);
        CellId(self.cells.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, id: CellId) -> Option<&KeyCell> {
        self.cells.get(id.0)
    }

    /// The last cell of `id`'s derivation chain.
    pub fn root(&self, id: CellId) -> CellId {
        let mut current = id;
        while let Some(KeyCell::Pending(Producer::Cell(next))) = self.cells.get(current.0) {
            current = *next;
        }
        current
    }

    /// Follow the derivation chain to a value or a pending root.
    pub fn deref(&self, id: CellId) -> Deref<'_> {
        let root = self.root(id);
        match self.cells.get(root.0) {
            Some(KeyCell::Resolved(v)) => Deref::Resolved(v),
            _ => Deref::Pending(root),
        }
    }

    /// The producer of `id`'s pending root, if it is still pending.
    pub fn producer(&self, id: CellId) -> Option<(&'static str, &'static str)> {
        match self.cells.get(self.root(id).0) {
            Some(KeyCell::Pending(Producer::Row { table, column })) => Some((*table, *column)),
            _ => None,
        }
    }

    /// Resolve the root of `id`'s chain, and with it every cell derived from it.
    pub fn resolve(&mut self, id: CellId, value: Value) {
        let root = self.root(id);
        tracing::trace!(cell = %root, value = %value, "Resolving key cell");
        if let Some(cell) = self.cells.get_mut(root.0) {
            *cell = KeyCell::Resolved(value);
        }
    }

    /// Make `target` copy `source` from now on.
    ///
    /// Nothing changes when `target` already resolved or both share a root.
    /// When `source` is already resolved the value is copied immediately.
    pub fn bind(&mut self, target: CellId, source: CellId) {
        let target_root = self.root(target);
        let source_root = self.root(source);
        if target_root == source_root {
            return;
        }
        match self.cells.get(target_root.0) {
            Some(KeyCell::Pending(_)) => {}
            _ => return,
        }
        let replacement = match self.cells.get(source_root.0) {
            Some(KeyCell::Resolved(v)) => KeyCell::Resolved(v.clone()),
            _ => KeyCell::Pending(Producer::Cell(source_root)),
        };
        if let Some(cell) = self.cells.get_mut(target_root.0) {
            *cell = replacement;
        }
    }
}
