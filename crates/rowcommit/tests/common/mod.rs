//! Shared harness for the flush integration tests: an in-memory store that
//! enforces keys and foreign keys, a recording object graph, and the
//! fixture schema.

#![allow(dead_code)]

use indexmap::IndexMap;
use rowcommit::{
    AttributeInfo, Collaborators, EntityMapping, EntityResolver, ExecutionError, FlushConfig,
    FlushEngine, FlushReport, GraphDiff, JoinSegment, MemoryJoinPathIndex, MemorySnapshotCache,
    ObjectGraph, ObjectId, RelationshipInfo, ReplacementMapping, SequenceKeyGenerator, Statement,
    StatementExecutor, StatementGroup, StatementResult, TableGraph, TableInfo, Value,
};
use std::collections::HashMap;

pub type Row = IndexMap<&'static str, Value>;

/// `(child table, [(fk column, parent column)], parent table)`
type ForeignKey = (&'static str, Vec<(&'static str, &'static str)>, &'static str);

/// A toy database: tables of rows, auto-increment counters, primary and
/// foreign key enforcement, and a log of every statement it ran.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub tables: IndexMap<&'static str, Vec<Row>>,
    keys: HashMap<&'static str, Vec<&'static str>>,
    auto_increment: HashMap<&'static str, &'static str>,
    foreign_keys: Vec<ForeignKey>,
    counters: HashMap<&'static str, i64>,
    pub log: Vec<(String, Vec<Value>)>,
    pub groups: Vec<usize>,
    /// Fail the next statement touching this table.
    pub fail_on: Option<&'static str>,
}

impl MemoryStore {
    pub fn for_mappings(mappings: &EntityResolver) -> Self {
        let mut store = Self::default();
        for table in mappings.tables() {
            store.tables.insert(table.name, Vec::new());
            store.keys.insert(table.name, table.key_names().collect());
            if let Some(key) = table.primary_key.iter().find(|k| k.auto_increment) {
                store.auto_increment.insert(table.name, key.name);
            }
        }
        for segment in mappings.segments() {
            let fk: ForeignKey = (
                segment.dependent_table(),
                segment.fk_pairs().collect(),
                segment.parent_table(),
            );
            if !store.foreign_keys.contains(&fk) {
                store.foreign_keys.push(fk);
            }
        }
        store
    }

    /// Seed a committed row, bumping the table's counter past its key.
    pub fn seed(&mut self, table: &'static str, row: &[(&'static str, Value)]) {
        let row: Row = row.iter().cloned().collect();
        if let Some(column) = self.auto_increment.get(table) {
            if let Some(id) = row.get(column).and_then(Value::as_i64) {
                let counter = self.counters.entry(table).or_insert(0);
                *counter = (*counter).max(id);
            }
        }
        self.tables.entry(table).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    pub fn find(&self, table: &str, column: &str, value: &Value) -> Option<&Row> {
        self.rows(table).iter().find(|row| row.get(column) == Some(value))
    }

    /// The statement log as JSON, for assertion messages.
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(&self.log).unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<&str> {
        self.log.iter().map(|(sql, _)| sql.as_str()).collect()
    }

    fn matches(row: &Row, qualifier: &[(&'static str, Value)]) -> bool {
        qualifier
            .iter()
            .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
    }

    fn check_unique(&self, table: &'static str, row: &Row) -> Result<(), ExecutionError> {
        let Some(keys) = self.keys.get(table) else {
            return Ok(());
        };
        let clash = self.rows(table).iter().any(|existing| {
            keys.iter().all(|k| existing.get(k).is_some() && existing.get(k) == row.get(k))
        });
        if clash {
            return Err(ExecutionError::statement(format!(
                "UNIQUE constraint failed: {table}"
            )));
        }
        Ok(())
    }

    fn check_parents(&self, table: &'static str, row: &Row) -> Result<(), ExecutionError> {
        for (child, pairs, parent) in &self.foreign_keys {
            if *child != table {
                continue;
            }
            let values: Vec<_> = pairs.iter().map(|(fk, _)| row.get(fk)).collect();
            if values.iter().any(|v| v.is_none_or(Value::is_null)) {
                continue;
            }
            let found = self.rows(parent).iter().any(|candidate| {
                pairs
                    .iter()
                    .zip(&values)
                    .all(|((_, pk), v)| candidate.get(pk) == *v)
            });
            if !found {
                return Err(ExecutionError::statement(format!(
                    "FOREIGN KEY constraint failed: {table} -> {parent}"
                )));
            }
        }
        Ok(())
    }

    fn check_children(&self, table: &'static str, row: &Row) -> Result<(), ExecutionError> {
        for (child, pairs, parent) in &self.foreign_keys {
            if *parent != table {
                continue;
            }
            let referenced = self.rows(child).iter().any(|candidate| {
                !std::ptr::eq(candidate, row)
                    && pairs
                        .iter()
                        .all(|(fk, pk)| candidate.get(fk).is_some() && candidate.get(fk) == row.get(pk))
            });
            if referenced {
                return Err(ExecutionError::statement(format!(
                    "FOREIGN KEY constraint failed: {child} still references {table}"
                )));
            }
        }
        Ok(())
    }

    fn run(&mut self, statement: &Statement) -> Result<StatementResult, ExecutionError> {
        if self.fail_on == Some(statement.table()) {
            self.fail_on = None;
            return Err(ExecutionError::statement("disk I/O error"));
        }
        match statement {
            Statement::Insert {
                table,
                columns,
                returning,
            } => {
                let table = *table;
                let mut row: Row = columns.iter().cloned().collect();
                let mut result = StatementResult::affected(1);
                for &column in returning {
                    let counter = self.counters.entry(table).or_insert(0);
                    *counter += 1;
                    let id = *counter;
                    row.insert(column, Value::BigInt(id));
                    result = result.with_key(column, id);
                }
                self.check_unique(table, &row)?;
                self.check_parents(table, &row)?;
                self.tables.entry(table).or_default().push(row);
                Ok(result)
            }
            Statement::Update {
                table,
                set,
                qualifier,
            } => {
                let table = *table;
                let mut updated = Vec::new();
                for row in self.tables.entry(table).or_default().iter_mut() {
                    if Self::matches(row, qualifier) {
                        for (column, value) in set {
                            row.insert(*column, value.clone());
                        }
                        updated.push(row.clone());
                    }
                }
                for row in &updated {
                    self.check_parents(table, row)?;
                }
                Ok(StatementResult::affected(updated.len() as u64))
            }
            Statement::Delete { table, qualifier } => {
                let table = *table;
                let mut affected = 0u64;
                for row in self.rows(table) {
                    if Self::matches(row, qualifier) {
                        self.check_children(table, row)?;
                        affected += 1;
                    }
                }
                if let Some(rows) = self.tables.get_mut(table) {
                    rows.retain(|row| !Self::matches(row, qualifier));
                }
                Ok(StatementResult::affected(affected))
            }
        }
    }
}

impl StatementExecutor for MemoryStore {
    fn execute(&mut self, group: &StatementGroup) -> Result<Vec<StatementResult>, ExecutionError> {
        self.groups.push(group.len());
        let mut results = Vec::with_capacity(group.len());
        for statement in group.iter() {
            self.log.push(statement.to_sql());
            results.push(self.run(statement)?);
        }
        Ok(results)
    }
}

/// Object graph that records what the engine told it.
#[derive(Debug, Default)]
pub struct RecordingGraph {
    pub repointed: Vec<(ObjectId, ObjectId)>,
    pub written: Vec<(ObjectId, &'static str, Value)>,
}

impl ObjectGraph for RecordingGraph {
    fn repoint(&mut self, from: &ObjectId, to: &ObjectId) {
        self.repointed.push((from.clone(), to.clone()));
    }

    fn write_back(&mut self, object: &ObjectId, attribute: &'static str, value: &Value) {
        self.written.push((object.clone(), attribute, value.clone()));
    }
}

/// Artists, paintings, galleries, an org chart, accounts and a read-only
/// ledger.
pub fn schema() -> EntityResolver {
    EntityResolver::new()
        .with_table(TableInfo::new("artists").generated_key("id"))
        .with_table(TableInfo::new("artist_info").key("artist_id"))
        .with_table(TableInfo::new("paintings").generated_key("id"))
        .with_table(TableInfo::new("galleries").key("code"))
        .with_table(
            TableInfo::new("artist_gallery")
                .key("artist_id")
                .key("gallery_code"),
        )
        .with_table(TableInfo::new("employees").generated_key("id"))
        .with_table(TableInfo::new("accounts").key("number"))
        .with_table(TableInfo::new("tickets").key("id"))
        .with_table(TableInfo::new("ledger").store("archive").generated_key("id"))
        .with_entity(
            EntityMapping::new("Artist", "artists")
                .attribute("id", "id")
                .attribute("name", "name")
                .flattened_attribute(AttributeInfo::flattened(
                    "bio",
                    "bio",
                    vec![JoinSegment::to_dependent_pk(
                        "artists",
                        "id",
                        "artist_info",
                        "artist_id",
                    )],
                ))
                .relationship(
                    RelationshipInfo::new(
                        "paintings",
                        "Painting",
                        JoinSegment::to_many("artists", "id", "paintings", "artist_id"),
                    )
                    .reverse("artist"),
                )
                .relationship(
                    RelationshipInfo::flattened(
                        "galleries",
                        "Gallery",
                        vec![
                            JoinSegment::to_many("artists", "id", "artist_gallery", "artist_id"),
                            JoinSegment::to_one(
                                "artist_gallery",
                                "gallery_code",
                                "galleries",
                                "code",
                            ),
                        ],
                    )
                    .reverse("artists"),
                ),
        )
        .with_entity(
            EntityMapping::new("Painting", "paintings")
                .attribute("title", "title")
                .relationship(
                    RelationshipInfo::new(
                        "artist",
                        "Artist",
                        JoinSegment::to_one("paintings", "artist_id", "artists", "id"),
                    )
                    .reverse("paintings"),
                ),
        )
        .with_entity(
            EntityMapping::new("Gallery", "galleries")
                .attribute("code", "code")
                .attribute("name", "name")
                .relationship(
                    RelationshipInfo::flattened(
                        "artists",
                        "Artist",
                        vec![
                            JoinSegment::to_many(
                                "galleries",
                                "code",
                                "artist_gallery",
                                "gallery_code",
                            ),
                            JoinSegment::to_one("artist_gallery", "artist_id", "artists", "id"),
                        ],
                    )
                    .reverse("galleries"),
                ),
        )
        .with_entity(
            EntityMapping::new("Employee", "employees")
                .attribute("name", "name")
                .attribute("salary", "salary")
                .relationship(
                    RelationshipInfo::new(
                        "manager",
                        "Employee",
                        JoinSegment::to_one("employees", "manager_id", "employees", "id"),
                    )
                    .reverse("reports"),
                )
                .relationship(
                    RelationshipInfo::new(
                        "reports",
                        "Employee",
                        JoinSegment::to_many("employees", "id", "employees", "manager_id"),
                    )
                    .reverse("manager"),
                ),
        )
        .with_entity(
            EntityMapping::new("Account", "accounts")
                .attribute("number", "number")
                .attribute("balance", "balance")
                .locked_attribute("version", "version"),
        )
        .with_entity(EntityMapping::new("Ticket", "tickets").attribute("seat", "seat"))
        .with_entity(
            EntityMapping::new("Ledger", "ledger")
                .attribute("entry", "entry")
                .read_only(true),
        )
}

/// Everything one flush needs, owned in one place.
pub struct Harness {
    pub mappings: EntityResolver,
    pub graph: TableGraph,
    pub config: FlushConfig,
    pub store: MemoryStore,
    pub objects: RecordingGraph,
    pub keys: SequenceKeyGenerator,
    pub join_paths: MemoryJoinPathIndex,
    pub snapshots: MemorySnapshotCache,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(FlushConfig::default())
    }

    pub fn with_config(config: FlushConfig) -> Self {
        let mappings = schema();
        let graph = TableGraph::from_resolver(&mappings);
        let store = MemoryStore::for_mappings(&mappings);
        Self {
            mappings,
            graph,
            config,
            store,
            objects: RecordingGraph::default(),
            keys: SequenceKeyGenerator::starting_at(1000),
            join_paths: MemoryJoinPathIndex::new(),
            snapshots: MemorySnapshotCache::new(),
        }
    }

    pub fn flush_report(&mut self, diff: &GraphDiff) -> rowcommit::Result<FlushReport> {
        let engine = FlushEngine::with_config(&self.mappings, &self.graph, self.config.clone());
        let mut collaborators = Collaborators {
            keys: &mut self.keys,
            executor: &mut self.store,
            snapshots: &mut self.snapshots,
            join_paths: &mut self.join_paths,
            objects: &mut self.objects,
        };
        engine.flush_report(diff, &mut collaborators)
    }

    pub fn flush(&mut self, diff: &GraphDiff) -> rowcommit::Result<ReplacementMapping> {
        self.flush_report(diff).map(|report| report.replacements)
    }
}

/// Position of the first logged statement starting with `prefix`.
pub fn position(store: &MemoryStore, prefix: &str) -> usize {
    store
        .statements()
        .iter()
        .position(|sql| sql.starts_with(prefix))
        .unwrap_or_else(|| panic!("no statement starting with {prefix:?} in {:?}", store.statements()))
}
