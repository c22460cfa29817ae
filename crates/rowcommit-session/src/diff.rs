//! Object-graph diffs consumed by a flush.
//!
//! The diff tracker that records these lives outside the engine; a
//! [`GraphDiff`] is the ordered stream of per-object changes it hands over.

use rowcommit_core::{ObjectId, RowSnapshot, Value};
use std::collections::HashMap;

/// Persistence status of a changed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceState {
    /// Not yet in the database.
    New,
    /// Loaded from the database and changed since.
    Modified,
    /// Loaded from the database and marked for deletion.
    Deleted,
}

/// One recorded change to an object.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffEvent {
    PropertyChanged {
        attribute: &'static str,
        old: Value,
        new: Value,
    },
    ArcAdded {
        relationship: &'static str,
        target: ObjectId,
    },
    ArcRemoved {
        relationship: &'static str,
        target: ObjectId,
    },
}

/// Ordered changes scoped to one root object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDiff {
    pub object: ObjectId,
    pub state: PersistenceState,
    pub events: Vec<DiffEvent>,
    /// Column values as last read from the database. Supplies optimistic
    /// locking values and the prior parent of self-referencing rows.
    pub committed: RowSnapshot,
    /// Secondary tables of flattened attributes that already hold a row
    /// for this object.
    pub secondary_rows: Vec<&'static str>,
}

impl ObjectDiff {
    pub fn new(object: ObjectId, state: PersistenceState) -> Self {
        Self {
            object,
            state,
            events: Vec::new(),
            committed: RowSnapshot::new(),
            secondary_rows: Vec::new(),
        }
    }

    /// Diff for a freshly created object.
    pub fn created(object: ObjectId) -> Self {
        Self::new(object, PersistenceState::New)
    }

    /// Diff for a committed object with pending changes.
    pub fn modified(object: ObjectId) -> Self {
        Self::new(object, PersistenceState::Modified)
    }

    /// Diff for a committed object marked for deletion.
    pub fn deleted(object: ObjectId) -> Self {
        Self::new(object, PersistenceState::Deleted)
    }

    /// Record a property change with no meaningful prior value.
    #[must_use]
    pub fn set(self, attribute: &'static str, new: impl Into<Value>) -> Self {
        self.change(attribute, Value::Null, new)
    }

    /// Record a property change.
    #[must_use]
    pub fn change(
        mut self,
        attribute: &'static str,
        old: impl Into<Value>,
        new: impl Into<Value>,
    ) -> Self {
        self.events.push(DiffEvent::PropertyChanged {
            attribute,
            old: old.into(),
            new: new.into(),
        });
        self
    }

    #[must_use]
    pub fn link(mut self, relationship: &'static str, target: ObjectId) -> Self {
        self.events.push(DiffEvent::ArcAdded {
            relationship,
            target,
        });
        self
    }

    #[must_use]
    pub fn unlink(mut self, relationship: &'static str, target: ObjectId) -> Self {
        self.events.push(DiffEvent::ArcRemoved {
            relationship,
            target,
        });
        self
    }

    /// Record a committed column value.
    #[must_use]
    pub fn committed(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.committed.insert(column, value.into());
        self
    }

    /// Record that the object's row in a secondary table exists.
    #[must_use]
    pub fn secondary_row(mut self, table: &'static str) -> Self {
        if !self.secondary_rows.contains(&table) {
            self.secondary_rows.push(table);
        }
        self
    }

    pub fn has_secondary_row(&self, table: &str) -> bool {
        self.secondary_rows.iter().any(|t| *t == table)
    }

    /// The last assigned value of an attribute in this diff.
    pub fn assigned(&self, attribute: &str) -> Option<&Value> {
        self.events.iter().rev().find_map(|event| match event {
            DiffEvent::PropertyChanged {
                attribute: name,
                new,
                ..
            } if *name == attribute => Some(new),
            _ => None,
        })
    }

    /// The value an attribute held before this diff's first change to it.
    pub fn prior(&self, attribute: &str) -> Option<&Value> {
        self.events.iter().find_map(|event| match event {
            DiffEvent::PropertyChanged {
                attribute: name,
                old,
                ..
            } if *name == attribute => Some(old),
            _ => None,
        })
    }
}

/// The full set of changes to flush, in recording order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDiff {
    diffs: Vec<ObjectDiff>,
}

impl GraphDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diff: ObjectDiff) {
        self.diffs.push(diff);
    }

    #[must_use]
    pub fn with(mut self, diff: ObjectDiff) -> Self {
        self.push(diff);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectDiff> {
        self.diffs.iter()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Total number of events across all diffs.
    pub fn event_count(&self) -> usize {
        self.diffs.iter().map(|d| d.events.len()).sum()
    }

    /// The first diff recorded for an object.
    pub fn find(&self, object: &ObjectId) -> Option<&ObjectDiff> {
        self.diffs.iter().find(|d| d.object == *object)
    }

    /// Effective state per object when an object appears in several diffs.
    ///
    /// Deletion dominates creation, which dominates modification.
    pub fn states(&self) -> HashMap<&ObjectId, PersistenceState> {
        let mut states = HashMap::new();
        for diff in &self.diffs {
            states
                .entry(&diff.object)
                .and_modify(|state: &mut PersistenceState| {
                    *state = dominant(*state, diff.state);
                })
                .or_insert(diff.state);
        }
        states
    }
}

fn dominant(a: PersistenceState, b: PersistenceState) -> PersistenceState {
    use PersistenceState::{Deleted, Modified, New};
    match (a, b) {
        (Deleted, _) | (_, Deleted) => Deleted,
        (New, _) | (_, New) => New,
        (Modified, Modified) => Modified,
    }
}

impl FromIterator<ObjectDiff> for GraphDiff {
    fn from_iter<I: IntoIterator<Item = ObjectDiff>>(iter: I) -> Self {
        Self {
            diffs: iter.into_iter().collect(),
        }
    }
}
