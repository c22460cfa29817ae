//! Core types for the rowcommit flush engine.
//!
//! This crate provides the vocabulary shared by the engine and its callers:
//!
//! - `Value` for dynamically typed column values
//! - `ObjectId` and `ReplacementMapping` for caller-side identities
//! - Mapping metadata (`TableInfo`, `EntityMapping`, `JoinSegment`, ...)
//! - `DependencyGraph` and the metadata-derived `TableGraph`
//! - The `Error` taxonomy shared by every stage

pub mod error;
pub mod graph;
pub mod mapping;
pub mod object;
pub mod value;

pub use error::{
    EntityError, Error, ErrorKind, ExecutionError, ExecutionErrorKind, GraphShapeError, KeyError,
    OptimisticLockError, Result,
};
pub use graph::{DependencyGraph, TableGraph};
pub use mapping::{
    AttributeInfo, EntityMapping, EntityResolver, FkSide, JoinSegment, KeyColumn,
    RelationshipInfo, TableInfo,
};
pub use object::{IdKey, ObjectId, ReplacementMapping, RowSnapshot};
pub use value::Value;
