//! A session that queues object diffs and flushes them.
//!
//! [`Session`] owns the state that must survive between flushes: the
//! key generator, the join-path index and the snapshot cache. The statement
//! executor and the object graph stay with the caller and are lent to each
//! [`Session::flush`].

use rowcommit_core::{DependencyGraph, EntityResolver, ObjectId, ReplacementMapping, Result};
use rowcommit_session::{
    Collaborators, FlushConfig, FlushCounts, FlushEngine, GraphDiff, KeyGenerator,
    MemoryJoinPathIndex, MemorySnapshotCache, ObjectDiff, ObjectGraph, SequenceKeyGenerator,
    StatementExecutor,
};

/// Pending changes plus the caches a flush keeps current.
pub struct Session<'m> {
    engine: FlushEngine<'m>,
    keys: Box<dyn KeyGenerator>,
    join_paths: MemoryJoinPathIndex,
    snapshots: MemorySnapshotCache,
    pending: GraphDiff,
    last_counts: FlushCounts,
}

impl<'m> Session<'m> {
    /// Create a session with default flush options and a sequence key
    /// generator.
    pub fn new(mappings: &'m EntityResolver, graph: &'m dyn DependencyGraph) -> Self {
        Self::with_config(mappings, graph, FlushConfig::default())
    }

    pub fn with_config(
        mappings: &'m EntityResolver,
        graph: &'m dyn DependencyGraph,
        config: FlushConfig,
    ) -> Self {
        Self {
            engine: FlushEngine::with_config(mappings, graph, config),
            keys: Box::new(SequenceKeyGenerator::new()),
            join_paths: MemoryJoinPathIndex::new(),
            snapshots: MemorySnapshotCache::new(),
            pending: GraphDiff::new(),
            last_counts: FlushCounts::default(),
        }
    }

    /// Replace the key generator (builder pattern).
    #[must_use]
    pub fn key_generator(mut self, keys: impl KeyGenerator + 'static) -> Self {
        self.keys = Box::new(keys);
        self
    }

    /// Queue a diff for the next flush.
    pub fn record(&mut self, diff: ObjectDiff) {
        self.pending.push(diff);
    }

    /// Queue several diffs.
    pub fn record_all(&mut self, diffs: impl IntoIterator<Item = ObjectDiff>) {
        for diff in diffs {
            self.record(diff);
        }
    }

    /// Diffs waiting for the next flush.
    pub fn pending(&self) -> &GraphDiff {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop every queued diff.
    pub fn discard(&mut self) {
        self.pending = GraphDiff::new();
    }

    /// Flush queued diffs through `executor`.
    ///
    /// On failure the diffs stay queued; statements that already ran are
    /// the caller's to roll back.
    pub fn flush(
        &mut self,
        executor: &mut dyn StatementExecutor,
        objects: &mut dyn ObjectGraph,
    ) -> Result<ReplacementMapping> {
        let pending = std::mem::take(&mut self.pending);
        let mut collaborators = Collaborators {
            keys: self.keys.as_mut(),
            executor,
            snapshots: &mut self.snapshots,
            join_paths: &mut self.join_paths,
            objects,
        };
        match self.engine.flush_report(&pending, &mut collaborators) {
            Ok(report) => {
                self.last_counts = report.counts;
                Ok(report.replacements)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Flush failed; keeping pending diffs");
                self.pending = pending;
                Err(e)
            }
        }
    }

    /// Row counts of the last successful flush.
    pub fn last_counts(&self) -> FlushCounts {
        self.last_counts
    }

    pub fn snapshots(&self) -> &MemorySnapshotCache {
        &self.snapshots
    }

    /// Seed the snapshot cache with a row loaded from the database.
    pub fn load(&mut self, object: ObjectId, columns: rowcommit_core::RowSnapshot) {
        self.snapshots.store(object, columns);
    }

    pub fn join_paths(&self) -> &MemoryJoinPathIndex {
        &self.join_paths
    }

    pub fn join_paths_mut(&mut self) -> &mut MemoryJoinPathIndex {
        &mut self.join_paths
    }
}
