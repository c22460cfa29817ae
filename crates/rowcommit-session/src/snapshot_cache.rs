//! In-memory snapshot cache.
//!
//! Holds the last known committed column values of each object, keyed by
//! its permanent id. A flush replaces the snapshots of the rows it wrote
//! and evicts the rows it deleted.

use crate::collaborators::SnapshotCache;
use rowcommit_core::{ObjectId, RowSnapshot};
use std::collections::HashMap;
use std::time::Instant;

/// A row snapshot and the time it was taken.
#[derive(Debug, Clone)]
pub struct CachedRow {
    columns: RowSnapshot,
    taken_at: Instant,
}

impl CachedRow {
    pub fn new(columns: RowSnapshot) -> Self {
        Self {
            columns,
            taken_at: Instant::now(),
        }
    }

    pub fn columns(&self) -> &RowSnapshot {
        &self.columns
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Snapshot cache backed by a hash map.
#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    rows: HashMap<ObjectId, CachedRow>,
}

impl MemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the committed state of an object, replacing any older one.
    #[tracing::instrument(level = "trace", skip(self, columns))]
    pub fn store(&mut self, object: ObjectId, columns: RowSnapshot) {
        tracing::trace!(columns = columns.len(), "Storing row snapshot");
        self.rows.insert(object, CachedRow::new(columns));
    }

    /// Committed column values of an object.
    pub fn get(&self, object: &ObjectId) -> Option<&RowSnapshot> {
        self.rows.get(object).map(CachedRow::columns)
    }

    pub fn entry(&self, object: &ObjectId) -> Option<&CachedRow> {
        self.rows.get(object)
    }

    pub fn contains(&self, object: &ObjectId) -> bool {
        self.rows.contains_key(object)
    }

    /// Columns whose current value differs from the snapshot.
    ///
    /// Without a snapshot every current column counts as changed.
    pub fn changed_columns(&self, object: &ObjectId, current: &RowSnapshot) -> Vec<&'static str> {
        let Some(cached) = self.rows.get(object) else {
            return current.keys().copied().collect();
        };
        current
            .iter()
            .filter(|(column, value)| cached.columns.get(*column) != Some(*value))
            .map(|(column, _)| *column)
            .collect()
    }

    pub fn remove(&mut self, object: &ObjectId) -> Option<CachedRow> {
        self.rows.remove(object)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl SnapshotCache for MemorySnapshotCache {
    #[tracing::instrument(level = "debug", skip_all, fields(updated = updated.len(), deleted = deleted.len()))]
    fn invalidate(&mut self, updated: &[(ObjectId, RowSnapshot)], deleted: &[ObjectId]) {
        for object in deleted {
            if self.rows.remove(object).is_some() {
                tracing::trace!(object = %object, "Evicted deleted row");
            }
        }
        for (object, columns) in updated {
            // merge over the old snapshot; an update only carries changed columns
            let mut merged = self
                .rows
                .remove(object)
                .map(|cached| cached.columns)
                .unwrap_or_default();
            for (column, value) in columns {
                merged.insert(*column, value.clone());
            }
            self.rows.insert(object.clone(), CachedRow::new(merged));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcommit_core::Value;

    fn row(pairs: &[(&'static str, Value)]) -> RowSnapshot {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_store_and_get() {
        let mut cache = MemorySnapshotCache::new();
        let id = ObjectId::single("Hero", "id", 1i64);
        assert!(cache.is_empty());

        cache.store(id.clone(), row(&[("name", Value::from("Spider-Man"))]));
        assert!(cache.contains(&id));
        assert_eq!(
            cache.get(&id).and_then(|r| r.get("name")),
            Some(&Value::from("Spider-Man"))
        );
        assert!(cache.entry(&id).is_some_and(|e| e.taken_at() <= Instant::now()));
    }

    #[test]
    fn test_changed_columns() {
        let mut cache = MemorySnapshotCache::new();
        let id = ObjectId::single("Hero", "id", 1i64);
        let current = row(&[("name", Value::from("Peter")), ("age", Value::Int(30))]);
        assert_eq!(cache.changed_columns(&id, &current), vec!["name", "age"]);

        cache.store(id.clone(), row(&[("name", Value::from("Peter")), ("age", Value::Int(25))]));
        assert_eq!(cache.changed_columns(&id, &current), vec!["age"]);
    }

    #[test]
    fn test_invalidate_merges_and_evicts() {
        let mut cache = MemorySnapshotCache::new();
        let kept = ObjectId::single("Hero", "id", 1i64);
        let gone = ObjectId::single("Hero", "id", 2i64);
        cache.store(kept.clone(), row(&[("name", Value::from("A")), ("age", Value::Int(1))]));
        cache.store(gone.clone(), row(&[("name", Value::from("B"))]));

        cache.invalidate(
            &[(kept.clone(), row(&[("age", Value::Int(2))]))],
            std::slice::from_ref(&gone),
        );
        assert_eq!(cache.len(), 1);
        let snapshot = cache.get(&kept).unwrap();
        assert_eq!(snapshot.get("name"), Some(&Value::from("A")));
        assert_eq!(snapshot.get("age"), Some(&Value::Int(2)));

        cache.clear();
        assert!(cache.remove(&kept).is_none());
    }
}
