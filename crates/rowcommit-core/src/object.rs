//! Object identities and row snapshots.
//!
//! An [`ObjectId`] names one object in the caller's graph. New objects carry a
//! temporary id until their flush assigns a permanent key; the swap is
//! reported back through a [`ReplacementMapping`].

use crate::Value;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// An ordered column → value map describing one database row.
pub type RowSnapshot = IndexMap<&'static str, Value>;

/// The key half of an [`ObjectId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum IdKey {
    /// A placeholder assigned by the caller to a not-yet-persisted object.
    Temporary(u64),
    /// The literal primary key, ordered like the entity's key columns.
    Permanent(Vec<(&'static str, Value)>),
}

/// Identity of an object in the caller's graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectId {
    entity: &'static str,
    key: IdKey,
}

impl ObjectId {
    /// Create a temporary id for a new object.
    pub const fn temporary(entity: &'static str, token: u64) -> Self {
        Self {
            entity,
            key: IdKey::Temporary(token),
        }
    }

    /// Create a permanent id from ordered key column values.
    pub fn permanent(entity: &'static str, key: Vec<(&'static str, Value)>) -> Self {
        Self {
            entity,
            key: IdKey::Permanent(key),
        }
    }

    /// Shorthand for a permanent id with a single key column.
    pub fn single(entity: &'static str, column: &'static str, value: impl Into<Value>) -> Self {
        Self::permanent(entity, vec![(column, value.into())])
    }

    /// Entity name this object belongs to.
    pub const fn entity(&self) -> &'static str {
        self.entity
    }

    /// The key half of the id.
    pub const fn key(&self) -> &IdKey {
        &self.key
    }

    /// Whether this id is still a placeholder.
    pub const fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// Value of one key column, for permanent ids.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        match &self.key {
            IdKey::Temporary(_) => None,
            IdKey::Permanent(pairs) => pairs
                .iter()
                .find(|(col, _)| *col == column)
                .map(|(_, v)| v),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdKey::Temporary(token) => write!(f, "{}<temp:{}>", self.entity, token),
            IdKey::Permanent(pairs) => {
                write!(f, "{}<", self.entity)?;
                for (i, (col, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{col}={value}")?;
                }
                write!(f, ">")
            }
        }
    }
}

/// Original → final identity pairs produced by one flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplacementMapping {
    pairs: Vec<(ObjectId, ObjectId)>,
}

impl ReplacementMapping {
    /// Create an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a replacement. Recording the same original twice keeps the
    /// latest final id.
    pub fn record(&mut self, original: ObjectId, replacement: ObjectId) {
        if let Some(entry) = self.pairs.iter_mut().find(|(from, _)| *from == original) {
            entry.1 = replacement;
        } else {
            self.pairs.push((original, replacement));
        }
    }

    /// Final id for an original id, if it changed.
    pub fn get(&self, original: &ObjectId) -> Option<&ObjectId> {
        self.pairs
            .iter()
            .find(|(from, _)| from == original)
            .map(|(_, to)| to)
    }

    /// Iterate over the recorded pairs in flush order.
    pub fn iter(&self) -> impl Iterator<Item = &(ObjectId, ObjectId)> {
        self.pairs.iter()
    }

    /// Number of recorded pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether nothing changed identity.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl IntoIterator for ReplacementMapping {
    type Item = (ObjectId, ObjectId);
    type IntoIter = std::vec::IntoIter<(ObjectId, ObjectId)>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.into_iter()
    }
}
