//! In-memory join-path index.
//!
//! Remembers the intermediate rows written for flattened relationship arcs
//! so that a later flush can delete a join row whose key is not derivable
//! from the two endpoints.

use crate::collaborators::{JoinPathIndex, JoinRowRecord};
use rowcommit_core::ObjectId;
use std::collections::HashMap;

/// Join rows keyed by `(source, relationship)`.
#[derive(Debug, Default)]
pub struct MemoryJoinPathIndex {
    records: HashMap<(ObjectId, &'static str), Vec<JoinRowRecord>>,
}

impl MemoryJoinPathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded arcs.
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.values().all(Vec::is_empty)
    }

    /// Drop every arc touching an object, in either direction.
    pub fn forget(&mut self, object: &ObjectId) {
        self.records.retain(|(source, _), records| {
            if source == object {
                return false;
            }
            records.retain(|r| r.target != *object);
            !records.is_empty()
        });
    }
}

impl JoinPathIndex for MemoryJoinPathIndex {
    fn rows(&self, source: &ObjectId, relationship: &str) -> Vec<JoinRowRecord> {
        self.records
            .iter()
            .filter(|((s, r), _)| s == source && *r == relationship)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    fn register(&mut self, record: JoinRowRecord) {
        tracing::trace!(
            source = %record.source,
            relationship = record.relationship,
            target = %record.target,
            rows = record.rows.len(),
            "Registering join rows"
        );
        let records = self
            .records
            .entry((record.source.clone(), record.relationship))
            .or_default();
        records.retain(|r| r.target != record.target);
        records.push(record);
    }

    fn unregister(&mut self, record: &JoinRowRecord) {
        let key = (record.source.clone(), record.relationship);
        if let Some(records) = self.records.get_mut(&key) {
            records.retain(|r| r.target != record.target);
            if records.is_empty() {
                self.records.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcommit_core::{RowSnapshot, Value};

    fn record(source: i64, target: &str) -> JoinRowRecord {
        let key: RowSnapshot = [
            ("artist_id", Value::BigInt(source)),
            ("gallery_code", Value::from(target)),
        ]
        .into_iter()
        .collect();
        JoinRowRecord {
            source: ObjectId::single("Artist", "id", source),
            relationship: "galleries",
            target: ObjectId::single("Gallery", "code", target),
            rows: vec![("artist_gallery", key)],
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut index = MemoryJoinPathIndex::new();
        index.register(record(1, "LOU"));
        index.register(record(1, "MET"));
        index.register(record(2, "LOU"));

        let artist = ObjectId::single("Artist", "id", 1i64);
        assert_eq!(index.rows(&artist, "galleries").len(), 2);
        assert!(index.rows(&artist, "paintings").is_empty());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_register_replaces_same_arc() {
        let mut index = MemoryJoinPathIndex::new();
        index.register(record(1, "LOU"));
        index.register(record(1, "LOU"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_unregister_by_arc() {
        let mut index = MemoryJoinPathIndex::new();
        index.register(record(1, "LOU"));
        let mut stale = record(1, "LOU");
        stale.rows.clear();
        index.unregister(&stale);
        assert!(index.is_empty());
    }

    #[test]
    fn test_forget_object() {
        let mut index = MemoryJoinPathIndex::new();
        index.register(record(1, "LOU"));
        index.register(record(2, "LOU"));
        index.register(record(2, "MET"));

        index.forget(&ObjectId::single("Gallery", "code", "LOU"));
        assert_eq!(index.len(), 1);
        index.forget(&ObjectId::single("Artist", "id", 2i64));
        assert!(index.is_empty());
    }
}
