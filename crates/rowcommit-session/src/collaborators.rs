//! Interfaces to the collaborators a flush borrows.
//!
//! The engine owns none of these: statement execution, key generation and
//! the session caches all live with the caller. A [`Collaborators`] bundle
//! hands them to [`FlushEngine::flush`](crate::FlushEngine::flush) for the
//! duration of one call.

use crate::execute::StatementGroup;
use indexmap::IndexMap;
use rowcommit_core::{ExecutionError, ObjectId, RowSnapshot, Value};

/// Source of key values the store does not generate itself.
pub trait KeyGenerator {
    fn generate(&mut self, table: &str, column: &str) -> Result<Value, ExecutionError>;
}

/// Outcome of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    pub rows_affected: u64,
    /// Store-generated key values of an inserted row, by column.
    pub generated_keys: RowSnapshot,
}

impl StatementResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_keys: RowSnapshot::new(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.generated_keys.insert(column, value.into());
        self
    }
}

/// Runs statement groups against a backing store.
///
/// Implementations return one result per statement, in order. An error
/// aborts the flush.
pub trait StatementExecutor {
    fn execute(&mut self, group: &StatementGroup) -> Result<Vec<StatementResult>, ExecutionError>;
}

/// Read-result cache kept in step with committed writes.
pub trait SnapshotCache {
    fn invalidate(&mut self, updated: &[(ObjectId, RowSnapshot)], deleted: &[ObjectId]);
}

/// Intermediate rows written for one flattened relationship arc.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRowRecord {
    pub source: ObjectId,
    pub relationship: &'static str,
    pub target: ObjectId,
    /// `(table, key)` of each intermediate row, in path order.
    pub rows: Vec<(&'static str, RowSnapshot)>,
}

impl JoinRowRecord {
    /// Whether this record describes the arc `source -relationship-> target`.
    pub fn is_arc(&self, source: &ObjectId, relationship: &str, target: &ObjectId) -> bool {
        self.source == *source && self.relationship == relationship && self.target == *target
    }
}

/// Session-scoped record of join rows written by earlier flushes.
pub trait JoinPathIndex {
    fn rows(&self, source: &ObjectId, relationship: &str) -> Vec<JoinRowRecord>;
    fn register(&mut self, record: JoinRowRecord);
    fn unregister(&mut self, record: &JoinRowRecord);
}

/// The caller-owned object graph.
pub trait ObjectGraph {
    /// Replace an object's identity after its row got a permanent key.
    fn repoint(&mut self, from: &ObjectId, to: &ObjectId);
    /// Store a resolved key value into a key-mapped attribute.
    fn write_back(&mut self, object: &ObjectId, attribute: &'static str, value: &Value);
}

/// Everything a flush borrows from the caller.
pub struct Collaborators<'a> {
    pub keys: &'a mut dyn KeyGenerator,
    pub executor: &'a mut dyn StatementExecutor,
    pub snapshots: &'a mut dyn SnapshotCache,
    pub join_paths: &'a mut dyn JoinPathIndex,
    pub objects: &'a mut dyn ObjectGraph,
}

/// Per-table counters, for stores without sequences of their own.
#[derive(Debug, Clone, Default)]
pub struct SequenceKeyGenerator {
    /// `None` once a sequence ran past `i64::MAX`.
    next: IndexMap<(String, String), Option<i64>>,
    start: i64,
}

impl SequenceKeyGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            next: IndexMap::new(),
            start,
        }
    }
}

impl KeyGenerator for SequenceKeyGenerator {
    fn generate(&mut self, table: &str, column: &str) -> Result<Value, ExecutionError> {
        let next = self
            .next
            .entry((table.to_string(), column.to_string()))
            .or_insert(Some(self.start));
        let value = next.ok_or_else(|| {
            ExecutionError::key_generation(format!("sequence for {table}.{column} exhausted"))
        })?;
        *next = value.checked_add(1);
        Ok(Value::BigInt(value))
    }
}

/// Key generator for mappings where every key is generated by the store or
/// assigned by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyGenerator;

impl KeyGenerator for NoKeyGenerator {
    fn generate(&mut self, table: &str, column: &str) -> Result<Value, ExecutionError> {
        Err(ExecutionError::key_generation(format!(
            "no key generator configured for {table}.{column}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_per_column() {
        let mut keys = SequenceKeyGenerator::starting_at(10);
        assert_eq!(keys.generate("a", "id").unwrap(), Value::BigInt(10));
        assert_eq!(keys.generate("a", "id").unwrap(), Value::BigInt(11));
        assert_eq!(keys.generate("b", "id").unwrap(), Value::BigInt(10));
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut keys = SequenceKeyGenerator::starting_at(i64::MAX);
        assert!(keys.generate("a", "id").is_ok());
        let err = keys.generate("a", "id").unwrap_err();
        assert_eq!(err.kind, rowcommit_core::ExecutionErrorKind::KeyGeneration);
    }

    #[test]
    fn test_no_key_generator_fails() {
        let err = NoKeyGenerator.generate("a", "id").unwrap_err();
        assert!(err.message.contains("a.id"));
    }

    #[test]
    fn test_record_matches_arc() {
        let record = JoinRowRecord {
            source: ObjectId::single("Artist", "id", 1i64),
            relationship: "galleries",
            target: ObjectId::single("Gallery", "id", 2i64),
            rows: Vec::new(),
        };
        assert!(record.is_arc(
            &ObjectId::single("Artist", "id", 1i64),
            "galleries",
            &ObjectId::single("Gallery", "id", 2i64)
        ));
        assert!(!record.is_arc(
            &ObjectId::single("Artist", "id", 1i64),
            "galleries",
            &ObjectId::single("Gallery", "id", 3i64)
        ));
    }
}
