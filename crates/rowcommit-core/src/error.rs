//! Error types for flush operations.
//!
//! Every error is fatal to the flush that raised it. Statement groups that
//! already ran are not unwound here; the caller's transaction boundary owns
//! rollback.

use crate::{ObjectId, Value};
use std::fmt;

/// The primary error type for all flush operations.
#[derive(Debug)]
pub enum Error {
    /// A diff touched an entity mapped as read-only.
    ImmutableEntity(EntityError),
    /// A new row's key could not be resolved.
    UnresolvableKey(KeyError),
    /// A row reached execution with a still-temporary key.
    MissingPrimaryKey(KeyError),
    /// An optimistic-lock qualified statement matched no rows.
    OptimisticLock(OptimisticLockError),
    /// The statement executor or key generator failed.
    Execution(ExecutionError),
    /// The diff referenced something the mapping does not describe.
    UnsupportedGraphShape(GraphShapeError),
}

/// Discriminant of [`Error`], for callers that branch on the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ImmutableEntity,
    UnresolvableKey,
    MissingPrimaryKey,
    OptimisticLock,
    StatementExecution,
    UnsupportedGraphShape,
}

#[derive(Debug)]
pub struct EntityError {
    pub entity: &'static str,
    pub object: ObjectId,
}

#[derive(Debug)]
pub struct KeyError {
    pub table: &'static str,
    pub column: Option<&'static str>,
    pub object: Option<ObjectId>,
    pub message: String,
}

#[derive(Debug)]
pub struct OptimisticLockError {
    pub table: &'static str,
    pub object: Option<ObjectId>,
    /// The qualifier that matched nothing, expected prior values included.
    pub qualifier: Vec<(&'static str, Value)>,
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub table: Option<&'static str>,
    pub object: Option<ObjectId>,
    pub sql: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The store rejected a statement
    Statement,
    /// The key generator failed
    KeyGeneration,
    /// The store reported an unexpected number of results or affected rows
    RowCount,
}

#[derive(Debug)]
pub struct GraphShapeError {
    pub object: Option<ObjectId>,
    pub message: String,
}

impl ExecutionError {
    /// Create an execution error with a message.
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            table: None,
            object: None,
            sql: None,
            source: None,
        }
    }

    /// Shorthand for a failed statement.
    pub fn statement(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Statement, message)
    }

    /// Shorthand for a failed key generation.
    pub fn key_generation(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::KeyGeneration, message)
    }

    /// Attach the underlying driver error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the offending table and object, keeping any already set.
    #[must_use]
    pub fn with_context(mut self, table: &'static str, object: Option<&ObjectId>) -> Self {
        self.table.get_or_insert(table);
        if self.object.is_none() {
            self.object = object.cloned();
        }
        self
    }

    /// Attach the rendered SQL of the failing statement.
    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql.get_or_insert_with(|| sql.into());
        self
    }
}

impl GraphShapeError {
    pub fn new(object: Option<&ObjectId>, message: impl Into<String>) -> Self {
        Self {
            object: object.cloned(),
            message: message.into(),
        }
    }
}

impl Error {
    /// The taxonomy entry of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::ImmutableEntity(_) => ErrorKind::ImmutableEntity,
            Error::UnresolvableKey(_) => ErrorKind::UnresolvableKey,
            Error::MissingPrimaryKey(_) => ErrorKind::MissingPrimaryKey,
            Error::OptimisticLock(_) => ErrorKind::OptimisticLock,
            Error::Execution(_) => ErrorKind::StatementExecution,
            Error::UnsupportedGraphShape(_) => ErrorKind::UnsupportedGraphShape,
        }
    }

    /// Is this a concurrent-modification conflict (refresh and re-flush may succeed)?
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// The object the error is about, if known.
    pub fn object(&self) -> Option<&ObjectId> {
        match self {
            Error::ImmutableEntity(e) => Some(&e.object),
            Error::UnresolvableKey(e) | Error::MissingPrimaryKey(e) => e.object.as_ref(),
            Error::OptimisticLock(e) => e.object.as_ref(),
            Error::Execution(e) => e.object.as_ref(),
            Error::UnsupportedGraphShape(e) => e.object.as_ref(),
        }
    }

    /// The SQL that failed, if available.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::OptimisticLock(e) => e.sql.as_deref(),
            Error::Execution(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

fn fmt_object(f: &mut fmt::Formatter<'_>, object: Option<&ObjectId>) -> fmt::Result {
    match object {
        Some(id) => write!(f, " (object {id})"),
        None => Ok(()),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ImmutableEntity(e) => write!(f, "Immutable entity: {e}"),
            Error::UnresolvableKey(e) => write!(f, "Unresolvable key: {e}"),
            Error::MissingPrimaryKey(e) => write!(f, "Missing primary key: {e}"),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {e}"),
            Error::Execution(e) => write!(f, "Statement execution error: {e}"),
            Error::UnsupportedGraphShape(e) => write!(f, "Unsupported graph shape: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Execution(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity '{}' is read-only and cannot be written (object {})",
            self.entity, self.object
        )
    }
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}.{}: {}", self.table, col, self.message)?,
            None => write!(f, "{}: {}", self.table, self.message)?,
        }
        fmt_object(f, self.object.as_ref())
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no rows in '{}' matched", self.table)?;
        for (i, (col, value)) in self.qualifier.iter().enumerate() {
            let sep = if i == 0 { " " } else { " AND " };
            write!(f, "{sep}{col} = {value}")?;
        }
        fmt_object(f, self.object.as_ref())
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table {
            Some(table) => write!(f, "{} on '{}'", self.message, table)?,
            None => write!(f, "{}", self.message)?,
        }
        fmt_object(f, self.object.as_ref())
    }
}

impl fmt::Display for GraphShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        fmt_object(f, self.object.as_ref())
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<EntityError> for Error {
    fn from(err: EntityError) -> Self {
        Error::ImmutableEntity(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<ExecutionError> for Error {
    fn from(err: ExecutionError) -> Self {
        Error::Execution(err)
    }
}

impl From<GraphShapeError> for Error {
    fn from(err: GraphShapeError) -> Self {
        Error::UnsupportedGraphShape(err)
    }
}

/// Result type alias for flush operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_conflict_flags() {
        let lock = Error::OptimisticLock(OptimisticLockError {
            table: "employees",
            object: Some(ObjectId::single("Employee", "id", 7i64)),
            qualifier: vec![("id", Value::BigInt(7)), ("salary", Value::BigInt(100))],
            sql: None,
        });
        assert_eq!(lock.kind(), ErrorKind::OptimisticLock);
        assert!(lock.is_concurrency_conflict());
        assert_eq!(
            lock.to_string(),
            "Optimistic lock failure: no rows in 'employees' matched id = 7 AND salary = 100 \
             (object Employee<id=7>)"
        );

        let shape: Error = GraphShapeError::new(None, "unknown entity 'Ghost'").into();
        assert_eq!(shape.kind(), ErrorKind::UnsupportedGraphShape);
        assert!(!shape.is_concurrency_conflict());
        assert!(shape.object().is_none());
    }

    #[test]
    fn execution_error_context_and_source() {
        let io = std::io::Error::other("connection reset");
        let err = ExecutionError::statement("insert failed")
            .with_source(io)
            .with_context("artists", Some(&ObjectId::temporary("Artist", 1)))
            .with_sql("INSERT INTO \"artists\" DEFAULT VALUES");

        assert_eq!(err.table, Some("artists"));
        let err: Error = err.into();
        assert_eq!(err.kind(), ErrorKind::StatementExecution);
        assert_eq!(err.sql(), Some("INSERT INTO \"artists\" DEFAULT VALUES"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            err.to_string(),
            "Statement execution error: insert failed on 'artists' (object Artist<temp:1>)"
        );
    }

    #[test]
    fn key_error_display_names_column() {
        let err = Error::UnresolvableKey(KeyError {
            table: "paintings",
            column: Some("id"),
            object: None,
            message: "second generated column".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Unresolvable key: paintings.id: second generated column"
        );
    }
}
