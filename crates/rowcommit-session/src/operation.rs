//! Pending row operations.
//!
//! Every stage of a flush works on [`RowOperation`]s: the builder creates
//! them, the merger collapses them, the sorter orders them, the resolver
//! fills in their keys and the executor turns them into statements.

use crate::cell::{CellArena, CellId, Deref};
use indexmap::IndexMap;
use rowcommit_core::{ObjectId, RowSnapshot, Value};
use serde::Serialize;
use std::fmt;

/// Kind of write a row operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Insert => write!(f, "INSERT"),
            OperationKind::Update => write!(f, "UPDATE"),
            OperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A column value that may not be known yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnValue {
    Literal(Value),
    Cell(CellId),
}

impl ColumnValue {
    pub fn is_literal(&self) -> bool {
        matches!(self, ColumnValue::Literal(_))
    }

    /// The current value, following cells.
    pub fn deref<'a>(&'a self, cells: &'a CellArena) -> Deref<'a> {
        match self {
            ColumnValue::Literal(v) => Deref::Resolved(v),
            ColumnValue::Cell(id) => cells.deref(*id),
        }
    }

    /// Comparable form: a literal, or the root of a pending chain.
    pub fn atom(&self, cells: &CellArena) -> Atom {
        match self.deref(cells) {
            Deref::Resolved(v) => Atom::Literal(v.clone()),
            Deref::Pending(root) => Atom::Pending(root),
        }
    }
}

impl From<Value> for ColumnValue {
    fn from(value: Value) -> Self {
        ColumnValue::Literal(value)
    }
}

/// One column assignment together with the event that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnWrite {
    pub value: ColumnValue,
    /// Position of the producing event in the diff stream.
    pub seq: u64,
}

impl ColumnWrite {
    /// Whether this write replaces `other` when both target one column.
    ///
    /// The later event wins; a literal beats a cell from the same event.
    pub fn supersedes(&self, other: &ColumnWrite) -> bool {
        self.seq > other.seq
            || (self.seq == other.seq && self.value.is_literal() && !other.value.is_literal())
    }
}

/// Key atom of an [`IdentityKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Atom {
    Literal(Value),
    Pending(CellId),
}

/// Effective identity of a row, used to detect operations on the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub table: &'static str,
    pub atoms: Vec<(&'static str, Atom)>,
}

impl IdentityKey {
    pub fn is_literal(&self) -> bool {
        self.atoms.iter().all(|(_, a)| matches!(a, Atom::Literal(_)))
    }
}

/// Table plus ordered key columns; values may still be cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeIdentity {
    pub table: &'static str,
    pub key: IndexMap<&'static str, ColumnValue>,
}

impl ChangeIdentity {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            key: IndexMap::new(),
        }
    }

    /// Identity with literal key values.
    pub fn literal(table: &'static str, key: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Self {
            table,
            key: key
                .into_iter()
                .map(|(col, v)| (col, ColumnValue::Literal(v)))
                .collect(),
        }
    }

    /// Effective identity, or `None` for a keyless row that never matches.
    pub fn effective(&self, cells: &CellArena) -> Option<IdentityKey> {
        if self.key.is_empty() {
            return None;
        }
        Some(IdentityKey {
            table: self.table,
            atoms: self
                .key
                .iter()
                .map(|(col, value)| (*col, value.atom(cells)))
                .collect(),
        })
    }

    /// Key values, if every one is known.
    pub fn resolved(&self, cells: &CellArena) -> Option<Vec<(&'static str, Value)>> {
        self.key
            .iter()
            .map(|(col, value)| value.deref(cells).value().map(|v| (*col, v.clone())))
            .collect()
    }

    /// Still waiting on at least one key value.
    pub fn is_temporary(&self, cells: &CellArena) -> bool {
        self.key
            .values()
            .any(|value| matches!(value.deref(cells), Deref::Pending(_)))
    }
}

/// The `(source, relationship, target)` arc a join row realises.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinArc {
    pub source: ObjectId,
    pub relationship: &'static str,
    pub target: ObjectId,
}

/// A pending write to one physical row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOperation {
    pub table: &'static str,
    pub kind: OperationKind,
    pub identity: ChangeIdentity,
    /// New column values (Insert/Update).
    pub values: IndexMap<&'static str, ColumnWrite>,
    /// Expected prior values of optimistic-locking columns.
    pub locks: IndexMap<&'static str, Value>,
    /// Column values last read from the database.
    pub committed: RowSnapshot,
    /// Object whose row this is; `None` for join rows.
    pub owner: Option<ObjectId>,
    pub join: Option<JoinArc>,
    /// The no-op half of an insert and delete of the same row.
    pub suppressed: bool,
    /// Position in the diff stream where this operation was first created.
    pub origin: u64,
}

impl RowOperation {
    pub fn new(kind: OperationKind, identity: ChangeIdentity, owner: Option<ObjectId>) -> Self {
        Self {
            table: identity.table,
            kind,
            identity,
            values: IndexMap::new(),
            locks: IndexMap::new(),
            committed: RowSnapshot::new(),
            owner,
            join: None,
            suppressed: false,
            origin: 0,
        }
    }

    #[must_use]
    pub fn with_join(mut self, arc: JoinArc) -> Self {
        self.join = Some(arc);
        self
    }

    pub fn is_insert(&self) -> bool {
        self.kind == OperationKind::Insert
    }

    pub fn is_update(&self) -> bool {
        self.kind == OperationKind::Update
    }

    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    /// Assign a column unless a later write already did.
    pub fn write(&mut self, column: &'static str, value: ColumnValue, seq: u64) {
        let incoming = ColumnWrite { value, seq };
        match self.values.get_mut(column) {
            Some(existing) if !incoming.supersedes(existing) => {}
            Some(existing) => *existing = incoming,
            None => {
                self.values.insert(column, incoming);
            }
        }
    }

    pub fn value(&self, column: &str) -> Option<&ColumnValue> {
        self.values.get(column).map(|w| &w.value)
    }

    /// Whether optimistic locking columns qualify this operation.
    pub fn is_locked(&self) -> bool {
        !self.locks.is_empty() && !self.is_insert()
    }

    /// Whether a statement will be produced for this operation.
    pub fn is_executable(&self) -> bool {
        !self.suppressed && !(self.is_update() && self.values.is_empty())
    }

    /// Short description for logs and errors.
    pub fn describe(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{} {} ({})", self.kind, self.table, owner),
            None => format!("{} {}", self.kind, self.table),
        }
    }
}
