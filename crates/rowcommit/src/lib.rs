//! rowcommit - the commit engine of an object-relational persistence layer.
//!
//! Given the pending creates, modifications and deletions of an in-memory
//! object graph, rowcommit emits the row writes that persist them, in an
//! order the database's foreign keys accept:
//!
//! - Operations on the same row are merged into one statement
//! - Parents are inserted before children and deleted after them
//! - Keys unknown until write time are resolved and propagated, through
//!   rows that are themselves still being inserted
//! - New objects are reported back with their permanent ids
//!
//! # Quick Start
//!
//! ```ignore
//! use rowcommit::prelude::*;
//!
//! let mappings = EntityResolver::new()
//!     .with_table(TableInfo::new("artists").generated_key("id"))
//!     .with_table(TableInfo::new("paintings").generated_key("id"))
//!     .with_entity(EntityMapping::new("Artist", "artists").attribute("name", "name"))
//!     .with_entity(
//!         EntityMapping::new("Painting", "paintings").relationship(RelationshipInfo::new(
//!             "artist",
//!             "Artist",
//!             JoinSegment::to_one("paintings", "artist_id", "artists", "id"),
//!         )),
//!     );
//! let graph = TableGraph::from_resolver(&mappings);
//! let mut session = Session::new(&mappings, &graph);
//!
//! let artist = ObjectId::temporary("Artist", 1);
//! session.record(ObjectDiff::created(artist.clone()).set("name", "Ada"));
//! session.record(
//!     ObjectDiff::created(ObjectId::temporary("Painting", 1)).link("artist", artist.clone()),
//! );
//!
//! // executor runs statements, objects receives new ids
//! let replacements = session.flush(&mut executor, &mut objects)?;
//! let permanent = replacements.get(&artist);
//! ```

pub mod session;

pub use rowcommit_core::{
    AttributeInfo, DependencyGraph, EntityError, EntityMapping, EntityResolver, Error, ErrorKind,
    ExecutionError, ExecutionErrorKind, FkSide, GraphShapeError, IdKey, JoinSegment, KeyColumn,
    KeyError, ObjectId, OptimisticLockError, RelationshipInfo, ReplacementMapping, Result,
    RowSnapshot, TableGraph, TableInfo, Value,
};
pub use rowcommit_session::{
    CachedRow, Collaborators, DiffEvent, FlushConfig, FlushCounts, FlushEngine, FlushReport,
    GraphDiff, JoinPathIndex, JoinRowRecord, KeyGenerator, MemoryJoinPathIndex,
    MemorySnapshotCache, NoKeyGenerator, ObjectDiff, ObjectGraph, PersistenceState,
    SequenceKeyGenerator, SnapshotCache, Statement, StatementExecutor, StatementGroup,
    StatementResult,
};
pub use session::Session;

/// Everything needed to map entities and flush diffs.
pub mod prelude {
    pub use crate::{
        // Mapping
        AttributeInfo,
        // Collaborators
        Collaborators,
        EntityMapping,
        EntityResolver,
        // Errors
        Error,
        ErrorKind,
        // Engine
        FlushConfig,
        FlushEngine,
        // Diffs
        GraphDiff,
        JoinSegment,
        KeyGenerator,
        ObjectDiff,
        ObjectGraph,
        ObjectId,
        RelationshipInfo,
        ReplacementMapping,
        Result,
        RowSnapshot,
        Session,
        Statement,
        StatementExecutor,
        StatementGroup,
        StatementResult,
        TableGraph,
        TableInfo,
        Value,
    };
}
