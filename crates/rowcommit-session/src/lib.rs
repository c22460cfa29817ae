//! Flush engine for rowcommit.
//!
//! `rowcommit-session` turns an object-graph diff into ordered row writes.
//! A flush runs in stages over a shared list of [`RowOperation`]s:
//!
//! 1. **Build**: one operation per touched row, foreign keys copied from
//!    parent rows as literals or as pending key cells.
//! 2. **Merge**: operations on the same row collapse into one.
//! 3. **Sort**: inserts before updates before deletes, tables in dependency
//!    order, self-referencing rows parent first.
//! 4. **Resolve**: new rows get their keys from assigned values, the store
//!    or the key generator.
//! 5. **Execute**: statements grouped by store and handed to the executor.
//! 6. **Postprocess**: identities repointed, join rows recorded, snapshots
//!    invalidated.
//!
//! The engine owns no connection and no caches. Everything it reads or
//! writes outside the diff is borrowed through [`Collaborators`] for the
//! duration of one [`FlushEngine::flush`] call. Errors are fatal to the
//! flush; rolling back statement groups that already ran is up to the
//! caller's transaction.
//!
//! # Example
//!
//! ```ignore
//! let engine = FlushEngine::new(&mappings, &graph);
//! let diff = GraphDiff::new()
//!     .with(ObjectDiff::created(ObjectId::temporary("Artist", 1)).set("name", "Ada"));
//! let replacements = engine.flush(&diff, &mut collaborators)?;
//! ```

pub mod cell;
pub mod collaborators;
pub mod diff;
pub mod execute;
pub mod join_index;
pub mod operation;
pub mod snapshot_cache;

mod builder;
mod merge;
mod postprocess;
mod resolve;
mod sort;

pub use cell::{CellArena, CellId, KeyCell, Producer};
pub use collaborators::{
    Collaborators, JoinPathIndex, JoinRowRecord, KeyGenerator, NoKeyGenerator, ObjectGraph,
    SequenceKeyGenerator, SnapshotCache, StatementExecutor, StatementResult,
};
pub use diff::{DiffEvent, GraphDiff, ObjectDiff, PersistenceState};
pub use execute::{FlushCounts, Statement, StatementGroup};
pub use join_index::MemoryJoinPathIndex;
pub use operation::{
    ChangeIdentity, ColumnValue, IdentityKey, JoinArc, OperationKind, RowOperation,
};
pub use snapshot_cache::{CachedRow, MemorySnapshotCache};

use rowcommit_core::{DependencyGraph, EntityResolver, ReplacementMapping, Result};
use std::time::Instant;

/// Flush behaviour knobs.
#[derive(Debug, Clone, Default)]
pub struct FlushConfig {
    /// Most statements per group; 0 means unlimited.
    pub max_batch_size: usize,
    /// Treat an unlocked update or delete that matches no rows as an error.
    pub strict_row_counts: bool,
    /// Trace-log every statement's SQL and parameters.
    pub log_statements: bool,
}

impl FlushConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `max_batch_size` option (builder pattern).
    #[must_use]
    pub fn max_batch_size(mut self, value: usize) -> Self {
        self.max_batch_size = value;
        self
    }

    /// Set the `strict_row_counts` option (builder pattern).
    #[must_use]
    pub fn strict_row_counts(mut self, value: bool) -> Self {
        self.strict_row_counts = value;
        self
    }

    /// Set the `log_statements` option (builder pattern).
    #[must_use]
    pub fn log_statements(mut self, value: bool) -> Self {
        self.log_statements = value;
        self
    }
}

/// Result of a flush: identity replacements plus row counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub replacements: ReplacementMapping,
    pub counts: FlushCounts,
}

/// Commits object-graph diffs as ordered row writes.
///
/// An engine is cheap to construct and holds no per-flush state; all of it
/// lives in the call.
pub struct FlushEngine<'m> {
    mappings: &'m EntityResolver,
    graph: &'m dyn DependencyGraph,
    config: FlushConfig,
}

impl<'m> FlushEngine<'m> {
    pub fn new(mappings: &'m EntityResolver, graph: &'m dyn DependencyGraph) -> Self {
        Self::with_config(mappings, graph, FlushConfig::default())
    }

    pub fn with_config(
        mappings: &'m EntityResolver,
        graph: &'m dyn DependencyGraph,
        config: FlushConfig,
    ) -> Self {
        Self {
            mappings,
            graph,
            config,
        }
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Flush a diff and return the identities that changed.
    pub fn flush(
        &self,
        diff: &GraphDiff,
        collaborators: &mut Collaborators<'_>,
    ) -> Result<ReplacementMapping> {
        self.flush_report(diff, collaborators)
            .map(|report| report.replacements)
    }

    /// Flush a diff and report identity replacements and row counts.
    #[tracing::instrument(level = "info", skip_all, fields(objects = diff.len(), events = diff.event_count()))]
    pub fn flush_report(
        &self,
        diff: &GraphDiff,
        collaborators: &mut Collaborators<'_>,
    ) -> Result<FlushReport> {
        if diff.is_empty() {
            tracing::debug!("Nothing to flush");
            return Ok(FlushReport::default());
        }
        let start = Instant::now();
        let mut cells = CellArena::new();

        let ops = builder::Builder::new(
            self.mappings,
            diff,
            &*collaborators.join_paths,
            &mut cells,
        )
        .build()?;
        let ops = merge::merge(ops, &cells);
        let ops = sort::sort(ops, self.graph, self.mappings, &cells);
        tracing::info!(
            operations = ops.len(),
            inserts = ops.iter().filter(|op| op.is_insert() && op.is_executable()).count(),
            updates = ops.iter().filter(|op| op.is_update() && op.is_executable()).count(),
            deletes = ops.iter().filter(|op| op.is_delete() && op.is_executable()).count(),
            "Executing flush"
        );

        resolve::resolve(&ops, self.mappings, &mut cells, &mut *collaborators.keys)?;
        resolve::validate(&ops, self.mappings, &cells)?;

        let mut executor = execute::Executor::new(self.mappings, &self.config);
        executor.run(&ops, &mut cells, &mut *collaborators.executor)?;

        let replacements = postprocess::postprocess(
            &ops,
            &executor.executed,
            &cells,
            self.mappings,
            postprocess::Sinks {
                join_paths: &mut *collaborators.join_paths,
                objects: &mut *collaborators.objects,
                snapshots: &mut *collaborators.snapshots,
            },
        )?;

        let counts = executor.counts;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = counts.inserted,
            updated = counts.updated,
            deleted = counts.deleted,
            groups = counts.groups,
            replaced = replacements.len(),
            "Flush complete"
        );
        Ok(FlushReport {
            replacements,
            counts,
        })
    }
}
