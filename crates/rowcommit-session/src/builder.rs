//! Row-operation builder.
//!
//! Walks every [`ObjectDiff`] and turns it into pending row operations:
//! one for the object's primary row, one per secondary table touched by a
//! flattened attribute, and one per intermediate row of a flattened
//! relationship. Foreign key values are copied from parent rows as literals
//! when the parent key is known and as cells when it is not.

use crate::cell::{CellArena, Deref};
use crate::collaborators::JoinPathIndex;
use crate::diff::{DiffEvent, GraphDiff, ObjectDiff, PersistenceState};
use crate::operation::{ChangeIdentity, ColumnValue, JoinArc, OperationKind, RowOperation};
use rowcommit_core::{
    EntityError, EntityMapping, EntityResolver, Error, FkSide, GraphShapeError, IdKey,
    JoinSegment, ObjectId, RelationshipInfo, Result, TableInfo, Value,
};
use std::collections::{HashMap, HashSet};

/// Sequence number of writes that clear a removed arc's foreign key.
///
/// Lower than any event, so a removal never overrides an assignment made
/// in the same flush.
const REMOVAL_SEQ: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowSlot {
    Primary(ObjectId),
    Secondary(ObjectId, &'static str),
    Join(JoinArc, usize),
}

/// A row along a relationship path.
#[derive(Debug, Clone, Copy)]
enum PathRow<'o> {
    Object(&'o ObjectId),
    /// Intermediate row at this position of the path.
    Join(usize),
}

const fn default_kind(state: PersistenceState) -> OperationKind {
    match state {
        PersistenceState::New => OperationKind::Insert,
        PersistenceState::Modified => OperationKind::Update,
        PersistenceState::Deleted => OperationKind::Delete,
    }
}

fn shape(object: Option<&ObjectId>, message: impl Into<String>) -> Error {
    Error::UnsupportedGraphShape(GraphShapeError::new(object, message))
}

/// Per-flush builder state.
pub(crate) struct Builder<'a> {
    mappings: &'a EntityResolver,
    diff: &'a GraphDiff,
    join_paths: &'a dyn JoinPathIndex,
    cells: &'a mut CellArena,
    states: HashMap<&'a ObjectId, PersistenceState>,
    ops: Vec<RowOperation>,
    /// Operations of the diff being processed, by row.
    slots: HashMap<RowSlot, usize>,
    identities: HashMap<ObjectId, ChangeIdentity>,
    secondary: HashMap<(ObjectId, &'static str), ChangeIdentity>,
    join_rows: HashMap<(JoinArc, usize), ChangeIdentity>,
    /// `(source, relationship, target, added)` arcs already propagated.
    processed: HashSet<(ObjectId, &'static str, ObjectId, bool)>,
    seq: u64,
}

impl<'a> Builder<'a> {
    pub fn new(
        mappings: &'a EntityResolver,
        diff: &'a GraphDiff,
        join_paths: &'a dyn JoinPathIndex,
        cells: &'a mut CellArena,
    ) -> Self {
        Self {
            mappings,
            diff,
            join_paths,
            cells,
            states: diff.states(),
            ops: Vec::new(),
            slots: HashMap::new(),
            identities: HashMap::new(),
            secondary: HashMap::new(),
            join_rows: HashMap::new(),
            processed: HashSet::new(),
            seq: 0,
        }
    }

    /// Build row operations for every diff, in diff order.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build(mut self) -> Result<Vec<RowOperation>> {
        let diff = self.diff;
        for object_diff in diff.iter() {
            self.slots.clear();
            self.build_object(object_diff)?;
        }
        tracing::debug!(
            objects = diff.len(),
            operations = self.ops.len(),
            cells = self.cells.len(),
            "Built row operations"
        );
        Ok(self.ops)
    }

    fn build_object(&mut self, diff: &'a ObjectDiff) -> Result<()> {
        let object = &diff.object;
        let entity = self.entity(object)?;
        let kind = default_kind(diff.state);
        self.object_op(object, Some(kind))?;

        for event in &diff.events {
            self.seq += 1;
            let seq = self.seq;
            match event {
                DiffEvent::PropertyChanged { attribute, new, .. } => {
                    if diff.state == PersistenceState::Deleted {
                        tracing::trace!(object = %object, attribute = *attribute, "Ignoring change to deleted object");
                        continue;
                    }
                    let attr = entity.find_attribute(attribute).ok_or_else(|| {
                        shape(
                            Some(object),
                            format!("entity '{}' has no attribute '{}'", entity.name, attribute),
                        )
                    })?;
                    let value = ColumnValue::Literal(new.clone());
                    let index = if attr.is_flattened() {
                        self.secondary_rows(object, &attr.path, kind, seq)?
                            .ok_or_else(|| shape(Some(object), "flattened attribute has an empty path"))?
                    } else {
                        self.object_op(object, Some(kind))?
                    };
                    self.ops[index].write(attr.column, value, seq);
                }
                DiffEvent::ArcAdded {
                    relationship,
                    target,
                } => {
                    if diff.state == PersistenceState::Deleted {
                        tracing::trace!(object = %object, relationship = *relationship, "Ignoring arc added to deleted object");
                        continue;
                    }
                    self.arc(object, entity, relationship, target, true, seq)?;
                }
                DiffEvent::ArcRemoved {
                    relationship,
                    target,
                } => self.arc(object, entity, relationship, target, false, seq)?,
            }
        }

        if diff.state == PersistenceState::Deleted {
            self.delete_dependents(object, entity)?;
        }
        Ok(())
    }

    fn entity(&self, object: &ObjectId) -> Result<&'a EntityMapping> {
        self.mappings.entity(object.entity()).ok_or_else(|| {
            shape(
                Some(object),
                format!("entity '{}' is not mapped", object.entity()),
            )
        })
    }

    fn table(&self, name: &str, object: Option<&ObjectId>) -> Result<&'a TableInfo> {
        self.mappings
            .table(name)
            .ok_or_else(|| shape(object, format!("table '{}' is not mapped", name)))
    }

    fn push(&mut self, slot: RowSlot, op: RowOperation) -> usize {
        let index = self.push_unslotted(op);
        self.slots.insert(slot, index);
        index
    }

    fn push_unslotted(&mut self, mut op: RowOperation) -> usize {
        op.origin = self.seq;
        let index = self.ops.len();
        self.ops.push(op);
        index
    }

    /// The last value assigned to an attribute across all diffs of an object.
    fn assigned(&self, object: &ObjectId, attribute: &str) -> Option<&'a Value> {
        let diff = self.diff;
        diff.iter()
            .filter(|d| d.object == *object)
            .filter_map(|d| d.assigned(attribute))
            .last()
    }

    /// Identity of an object's primary row, created once per flush.
    fn identity_of(&mut self, object: &ObjectId) -> Result<ChangeIdentity> {
        if let Some(identity) = self.identities.get(object) {
            return Ok(identity.clone());
        }
        let entity = self.entity(object)?;
        let table = self.table(entity.table, Some(object))?;
        let mut identity = ChangeIdentity::new(table.name);

        match object.key() {
            IdKey::Permanent(_) => {
                for key in &table.primary_key {
                    let value = object.key_value(key.name).ok_or_else(|| {
                        shape(
                            Some(object),
                            format!("permanent id lacks key column '{}'", key.name),
                        )
                    })?;
                    identity
                        .key
                        .insert(key.name, ColumnValue::Literal(value.clone()));
                }
            }
            IdKey::Temporary(_) => {
                if !self.states.contains_key(object) {
                    return Err(shape(
                        Some(object),
                        "temporary object is referenced but has no diff",
                    ));
                }
                for key in &table.primary_key {
                    let meaningful = entity
                        .attribute_for_column(key.name)
                        .and_then(|attr| self.assigned(object, attr.name))
                        .filter(|v| v.is_assigned());
                    let value = match meaningful {
                        Some(v) => ColumnValue::Literal(v.clone()),
                        None => ColumnValue::Cell(self.cells.pending_row(table.name, key.name)),
                    };
                    identity.key.insert(key.name, value);
                }
            }
        }

        self.identities.insert(object.clone(), identity.clone());
        Ok(identity)
    }

    /// The operation on an object's primary row in the current diff.
    ///
    /// Without an explicit kind the object's effective state decides;
    /// objects outside the diff are committed rows and get an update.
    fn object_op(&mut self, object: &ObjectId, kind: Option<OperationKind>) -> Result<usize> {
        let slot = RowSlot::Primary(object.clone());
        if let Some(&index) = self.slots.get(&slot) {
            return Ok(index);
        }

        let entity = self.entity(object)?;
        if entity.read_only {
            return Err(Error::ImmutableEntity(EntityError {
                entity: entity.name,
                object: object.clone(),
            }));
        }
        let kind = kind.unwrap_or_else(|| {
            self.states
                .get(object)
                .map_or(OperationKind::Update, |state| default_kind(*state))
        });
        let identity = self.identity_of(object)?;

        let mut op = RowOperation::new(kind, identity, Some(object.clone()));
        let diff = self.diff;
        if let Some(source) = diff.find(object) {
            op.committed = source.committed.clone();
        }
        if kind != OperationKind::Insert {
            for column in &entity.locking {
                let prior = op.committed.get(column).cloned().or_else(|| {
                    entity
                        .attribute_for_column(column)
                        .and_then(|attr| diff.find(object).and_then(|d| d.prior(attr.name)))
                        .cloned()
                });
                let prior = prior.ok_or_else(|| {
                    shape(
                        Some(object),
                        format!(
                            "locking column {}.{} has no committed value",
                            entity.table, column
                        ),
                    )
                })?;
                op.locks.insert(*column, prior);
            }
        }
        Ok(self.push(slot, op))
    }

    /// Copy `source` into a key atom, binding cells where needed.
    fn bind_atom(&mut self, atom: &ColumnValue, source: &ColumnValue) {
        let ColumnValue::Cell(target) = atom else {
            return;
        };
        // only an unbound, unresolved cell takes a new source
        match self.cells.deref(*target) {
            Deref::Pending(root) if root == *target => {}
            _ => {
                tracing::trace!(cell = %target, "Key cell already propagated");
                return;
            }
        }
        match source {
            ColumnValue::Literal(value) => self.cells.resolve(*target, value.clone()),
            ColumnValue::Cell(cell) => self.cells.bind(*target, *cell),
        }
    }

    /// The value of a column of an object's primary row.
    fn object_value(&mut self, object: &ObjectId, column: &'static str) -> Result<ColumnValue> {
        let identity = self.identity_of(object)?;
        if let Some(value) = identity.key.get(column) {
            return Ok(value.clone());
        }
        let entity = self.entity(object)?;
        if let Some(value) = entity
            .attribute_for_column(column)
            .and_then(|attr| self.assigned(object, attr.name))
        {
            return Ok(ColumnValue::Literal(value.clone()));
        }
        let diff = self.diff;
        diff.find(object)
            .and_then(|d| d.committed.get(column))
            .map(|v| ColumnValue::Literal(v.clone()))
            .ok_or_else(|| {
                shape(
                    Some(object),
                    format!("no value for referenced column {}.{}", identity.table, column),
                )
            })
    }

    /// Set a foreign key column on an object's primary row.
    fn assign_object(
        &mut self,
        object: &ObjectId,
        column: &'static str,
        value: ColumnValue,
        seq: u64,
    ) -> Result<()> {
        let identity = self.identity_of(object)?;
        if let Some(atom) = identity.key.get(column) {
            self.bind_atom(atom, &value);
            // the row still has to be written
            if self.states.contains_key(object) {
                self.object_op(object, None)?;
            }
            return Ok(());
        }
        let index = self.object_op(object, None)?;
        self.ops[index].write(column, value, seq);
        Ok(())
    }

    /// Null a foreign key column after its arc was removed.
    fn clear_object(&mut self, object: &ObjectId, column: &'static str) -> Result<()> {
        let identity = self.identity_of(object)?;
        if identity.key.contains_key(column) {
            tracing::debug!(
                object = %object,
                column = column,
                "Arc removal touches a key column; leaving row for its own delete"
            );
            return Ok(());
        }
        let index = self.object_op(object, None)?;
        self.ops[index].write(column, ColumnValue::Literal(Value::Null), REMOVAL_SEQ);
        Ok(())
    }

    fn arc(
        &mut self,
        source: &ObjectId,
        entity: &'a EntityMapping,
        relationship: &str,
        target: &ObjectId,
        added: bool,
        seq: u64,
    ) -> Result<()> {
        let rel = entity.find_relationship(relationship).ok_or_else(|| {
            shape(
                Some(source),
                format!(
                    "entity '{}' has no relationship '{}'",
                    entity.name, relationship
                ),
            )
        })?;
        if target.entity() != rel.target_entity {
            return Err(shape(
                Some(source),
                format!(
                    "relationship '{}' expects '{}', got {}",
                    rel.name, rel.target_entity, target
                ),
            ));
        }

        if !self
            .processed
            .insert((source.clone(), rel.name, target.clone(), added))
        {
            return Ok(());
        }
        if let Some(reverse) = rel.reverse {
            self.processed
                .insert((target.clone(), reverse, source.clone(), added));
        }

        match rel.path.as_slice() {
            [] => Err(shape(
                Some(source),
                format!("relationship '{}' has no join path", rel.name),
            )),
            [segment] => self.single_arc(source, segment, target, added, seq),
            _ => self.flattened_arc(source, rel, target, added, seq),
        }
    }

    fn single_arc(
        &mut self,
        source: &ObjectId,
        segment: &JoinSegment,
        target: &ObjectId,
        added: bool,
        seq: u64,
    ) -> Result<()> {
        let (child, parent) = match segment.fk {
            FkSide::Source => (source, target),
            FkSide::Target => (target, source),
        };
        for (fk, reference) in segment.fk_pairs() {
            if added {
                let value = self.object_value(parent, reference)?;
                self.assign_object(child, fk, value, seq)?;
            } else {
                self.clear_object(child, fk)?;
            }
        }
        Ok(())
    }

    /// Identity of the intermediate row at `position` of an arc's path.
    fn join_identity(
        &mut self,
        arc: &JoinArc,
        position: usize,
        table: &'static str,
    ) -> Result<ChangeIdentity> {
        let cache_key = (arc.clone(), position);
        if let Some(identity) = self.join_rows.get(&cache_key) {
            return Ok(identity.clone());
        }
        let info = self.table(table, Some(&arc.source))?;
        let mut identity = ChangeIdentity::new(table);
        for key in &info.primary_key {
            identity
                .key
                .insert(key.name, ColumnValue::Cell(self.cells.pending_row(table, key.name)));
        }
        self.join_rows.insert(cache_key, identity.clone());
        Ok(identity)
    }

    fn path_value(
        &mut self,
        row: PathRow<'_>,
        identities: &[ChangeIdentity],
        column: &'static str,
    ) -> Result<ColumnValue> {
        match row {
            PathRow::Object(object) => self.object_value(object, column),
            PathRow::Join(position) => identities
                .get(position - 1)
                .and_then(|identity| identity.key.get(column))
                .cloned()
                .ok_or_else(|| {
                    shape(
                        None,
                        format!("join row column '{}' is not a key column", column),
                    )
                }),
        }
    }

    fn flattened_arc(
        &mut self,
        source: &ObjectId,
        rel: &'a RelationshipInfo,
        target: &ObjectId,
        added: bool,
        seq: u64,
    ) -> Result<()> {
        let arc = JoinArc {
            source: source.clone(),
            relationship: rel.name,
            target: target.clone(),
        };
        let path = &rel.path;

        // rows[0] is the source, rows[n] the target, the rest join rows
        let mut rows = vec![PathRow::Object(source)];
        let mut identities = Vec::with_capacity(path.len() - 1);
        for position in 1..path.len() {
            let table = path[position - 1].target_table;
            if path[position].source_table != table {
                return Err(shape(
                    Some(source),
                    format!("relationship '{}' has a broken join path", rel.name),
                ));
            }
            identities.push(self.join_identity(&arc, position, table)?);
            rows.push(PathRow::Join(position));
        }
        rows.push(PathRow::Object(target));

        let mut join_ops = HashMap::new();
        if added {
            for (offset, identity) in identities.iter().enumerate() {
                let position = offset + 1;
                let slot = RowSlot::Join(arc.clone(), position);
                let index = match self.slots.get(&slot) {
                    Some(&index) => index,
                    None => {
                        let op = RowOperation::new(OperationKind::Insert, identity.clone(), None)
                            .with_join(arc.clone());
                        self.push(slot, op)
                    }
                };
                join_ops.insert(position, index);
            }
        }

        for (position, segment) in path.iter().enumerate() {
            let (child, parent) = match segment.fk {
                FkSide::Source => (rows[position], rows[position + 1]),
                FkSide::Target => (rows[position + 1], rows[position]),
            };
            for (fk, reference) in segment.fk_pairs() {
                let value = self.path_value(parent, &identities, reference)?;
                match child {
                    PathRow::Object(object) if added => self.assign_object(object, fk, value, seq)?,
                    PathRow::Object(object) => self.clear_object(object, fk)?,
                    PathRow::Join(position) => {
                        let identity = &identities[position - 1];
                        if let Some(atom) = identity.key.get(fk) {
                            let atom = atom.clone();
                            self.bind_atom(&atom, &value);
                        } else if let Some(&index) = join_ops.get(&position) {
                            self.ops[index].write(fk, value, seq);
                        }
                    }
                }
            }
        }

        if !added {
            self.delete_join_rows(&arc, rel, &identities)?;
        }
        Ok(())
    }

    /// Emit deletes for the intermediate rows of a removed arc.
    fn delete_join_rows(
        &mut self,
        arc: &JoinArc,
        rel: &RelationshipInfo,
        identities: &[ChangeIdentity],
    ) -> Result<()> {
        let cells = &*self.cells;
        let derived: Option<Vec<_>> = identities
            .iter()
            .map(|identity| identity.resolved(cells).map(|key| (identity.table, key)))
            .collect();

        let rows = match derived {
            Some(rows) => rows,
            None => {
                let record = self
                    .join_paths
                    .rows(&arc.source, arc.relationship)
                    .into_iter()
                    .find(|r| r.is_arc(&arc.source, arc.relationship, &arc.target))
                    .or_else(|| {
                        let reverse = rel.reverse?;
                        self.join_paths
                            .rows(&arc.target, reverse)
                            .into_iter()
                            .find(|r| r.is_arc(&arc.target, reverse, &arc.source))
                    })
                    .ok_or_else(|| {
                        shape(
                            Some(&arc.source),
                            format!(
                                "no recorded join row for '{}' to {}",
                                arc.relationship, arc.target
                            ),
                        )
                    })?;
                record
                    .rows
                    .into_iter()
                    .map(|(table, key)| (table, key.into_iter().collect()))
                    .collect()
            }
        };

        for (table, key) in rows {
            let op = RowOperation::new(
                OperationKind::Delete,
                ChangeIdentity::literal(table, key),
                None,
            )
            .with_join(arc.clone());
            self.push_unslotted(op);
        }
        Ok(())
    }

    /// Whether any diff of `object` records its row in `table`.
    fn has_secondary_row(&self, object: &ObjectId, table: &str) -> bool {
        let diff = self.diff;
        diff.iter()
            .filter(|d| d.object == *object)
            .any(|d| d.has_secondary_row(table))
    }

    /// Operations for the secondary rows along a flattened attribute path.
    ///
    /// A changed object inserts the rows it does not have yet; a deleted
    /// one deletes only the rows it has. Returns the index of the last
    /// row's operation.
    fn secondary_rows(
        &mut self,
        object: &ObjectId,
        path: &[JoinSegment],
        kind: OperationKind,
        seq: u64,
    ) -> Result<Option<usize>> {
        let mut parent = self.identity_of(object)?;
        let mut last = None;

        for segment in path {
            let table = segment.target_table;
            let identity = match self.secondary.get(&(object.clone(), table)) {
                Some(identity) => identity.clone(),
                None => {
                    let info = self.table(table, Some(object))?;
                    let mut identity = ChangeIdentity::new(table);
                    for key in &info.primary_key {
                        identity.key.insert(
                            key.name,
                            ColumnValue::Cell(self.cells.pending_row(table, key.name)),
                        );
                    }
                    for (fk, reference) in segment.fk_pairs() {
                        let source = parent.key.get(reference).cloned().ok_or_else(|| {
                            shape(
                                Some(object),
                                format!("secondary table '{}' must join on a key column", table),
                            )
                        })?;
                        if let Some(atom) = identity.key.get(fk) {
                            self.bind_atom(atom, &source);
                        }
                    }
                    self.secondary
                        .insert((object.clone(), table), identity.clone());
                    identity
                }
            };

            let exists = self.has_secondary_row(object, table);
            let row_kind = match kind {
                OperationKind::Update if !exists => OperationKind::Insert,
                OperationKind::Delete if !exists => {
                    tracing::trace!(object = %object, table = table, "No secondary row to delete");
                    parent = identity;
                    continue;
                }
                other => other,
            };

            let slot = RowSlot::Secondary(object.clone(), table);
            let index = match self.slots.get(&slot) {
                Some(&index) => index,
                None => {
                    let mut op =
                        RowOperation::new(row_kind, identity.clone(), Some(object.clone()));
                    for (fk, reference) in segment.fk_pairs() {
                        if !identity.key.contains_key(fk) {
                            if let Some(source) = parent.key.get(reference) {
                                op.write(fk, source.clone(), seq);
                            }
                        }
                    }
                    self.push(slot, op)
                }
            };
            parent = identity;
            last = Some(index);
        }

        Ok(last)
    }

    /// Deletes for a deleted object's secondary rows and recorded join rows.
    fn delete_dependents(&mut self, object: &ObjectId, entity: &'a EntityMapping) -> Result<()> {
        let mut seen = HashSet::new();
        for attr in entity.attributes.iter().filter(|a| a.is_flattened()) {
            let key = attr.path.iter().map(|s| s.target_table).collect::<Vec<_>>();
            if seen.insert(key) {
                self.secondary_rows(object, &attr.path, OperationKind::Delete, self.seq)?;
            }
        }

        for rel in entity.relationships.iter().filter(|r| r.is_flattened()) {
            for record in self.join_paths.rows(object, rel.name) {
                let arc = JoinArc {
                    source: record.source.clone(),
                    relationship: record.relationship,
                    target: record.target.clone(),
                };
                for (table, key) in record.rows {
                    let op = RowOperation::new(
                        OperationKind::Delete,
                        ChangeIdentity::literal(table, key),
                        None,
                    )
                    .with_join(arc.clone());
                    self.push_unslotted(op);
                }
            }
        }
        Ok(())
    }
}
