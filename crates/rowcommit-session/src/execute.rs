//! Statement materialization and execution.
//!
//! Ordered row operations become [`Statement`]s, which are grouped by
//! backing store and handed to the [`StatementExecutor`] group by group.
//! A group is closed early when the next statement needs a key generated
//! inside it, after every optimistic-lock qualified statement, and at the
//! configured batch size.

use crate::FlushConfig;
use crate::cell::{CellArena, CellId, Deref};
use crate::collaborators::{StatementExecutor, StatementResult};
use crate::operation::{ColumnValue, OperationKind, RowOperation};
use rowcommit_core::{
    EntityResolver, Error, ExecutionError, ExecutionErrorKind, GraphShapeError, KeyError,
    OptimisticLockError, Result, RowSnapshot, TableInfo, Value,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// A materialized write.
///
/// Qualifier entries holding [`Value::Null`] test `IS NULL`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Statement {
    Insert {
        table: &'static str,
        columns: Vec<(&'static str, Value)>,
        /// Store-generated key columns to read back.
        returning: Vec<&'static str>,
    },
    Update {
        table: &'static str,
        set: Vec<(&'static str, Value)>,
        qualifier: Vec<(&'static str, Value)>,
    },
    Delete {
        table: &'static str,
        qualifier: Vec<(&'static str, Value)>,
    },
}

impl Statement {
    pub fn table(&self) -> &'static str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => *table,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Statement::Insert { .. } => OperationKind::Insert,
            Statement::Update { .. } => OperationKind::Update,
            Statement::Delete { .. } => OperationKind::Delete,
        }
    }

    /// WHERE-clause entries of an update or delete.
    pub fn qualifier(&self) -> &[(&'static str, Value)] {
        match self {
            Statement::Insert { .. } => &[],
            Statement::Update { qualifier, .. } | Statement::Delete { qualifier, .. } => qualifier,
        }
    }

    /// Render ANSI SQL with `$n` placeholders.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params: Vec<Value> = Vec::new();
        let sql = match self {
            Statement::Insert {
                table,
                columns,
                returning,
            } => {
                let mut sql = if columns.is_empty() {
                    format!("INSERT INTO \"{}\" DEFAULT VALUES", table)
                } else {
                    let col_list = columns
                        .iter()
                        .map(|(c, _)| format!("\"{}\"", c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let placeholders = columns
                        .iter()
                        .map(|(_, v)| {
                            params.push(v.clone());
                            format!("${}", params.len())
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "INSERT INTO \"{}\" ({}) VALUES ({})",
                        table, col_list, placeholders
                    )
                };
                if !returning.is_empty() {
                    let ret = returning
                        .iter()
                        .map(|c| format!("\"{}\"", c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(" RETURNING {}", ret));
                }
                sql
            }
            Statement::Update {
                table,
                set,
                qualifier,
            } => {
                let set_clause = set
                    .iter()
                    .map(|(c, v)| {
                        params.push(v.clone());
                        format!("\"{}\" = ${}", c, params.len())
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let where_clause = where_clause(qualifier, &mut params);
                format!(
                    "UPDATE \"{}\" SET {} WHERE {}",
                    table, set_clause, where_clause
                )
            }
            Statement::Delete { table, qualifier } => {
                let where_clause = where_clause(qualifier, &mut params);
                format!("DELETE FROM \"{}\" WHERE {}", table, where_clause)
            }
        };
        (sql, params)
    }
}

fn where_clause(qualifier: &[(&'static str, Value)], params: &mut Vec<Value>) -> String {
    qualifier
        .iter()
        .map(|(c, v)| {
            if v.is_null() {
                format!("\"{}\" IS NULL", c)
            } else {
                params.push(v.clone());
                format!("\"{}\" = ${}", c, params.len())
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql().0)
    }
}

/// Consecutive statements for one backing store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementGroup {
    pub store: &'static str,
    pub statements: Vec<Statement>,
}

impl StatementGroup {
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Statement> {
        self.statements.iter()
    }
}

/// Row counts of one flush, like the counters a session reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub groups: usize,
}

impl FlushCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// A statement that ran, with the column values it wrote.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExecutedRow {
    /// Index into the ordered operation list.
    pub index: usize,
    /// Written values, generated keys included; the key for deletes.
    pub columns: RowSnapshot,
}

#[derive(Debug)]
struct Planned {
    index: usize,
    locked: bool,
    /// Pending key cells the store fills in for this insert.
    generated: Vec<(&'static str, CellId)>,
}

#[derive(Debug)]
struct OpenGroup {
    store: &'static str,
    statements: Vec<Statement>,
    planned: Vec<Planned>,
    produces: HashSet<CellId>,
}

impl OpenGroup {
    fn new(store: &'static str) -> Self {
        Self {
            store,
            statements: Vec::new(),
            planned: Vec::new(),
            produces: HashSet::new(),
        }
    }
}

/// Runs the ordered operations.
pub(crate) struct Executor<'a> {
    pub mappings: &'a EntityResolver,
    pub config: &'a FlushConfig,
    pub executed: Vec<ExecutedRow>,
    pub counts: FlushCounts,
}

impl<'a> Executor<'a> {
    pub fn new(mappings: &'a EntityResolver, config: &'a FlushConfig) -> Self {
        Self {
            mappings,
            config,
            executed: Vec::new(),
            counts: FlushCounts::default(),
        }
    }

    /// Execute every executable operation in order.
    #[tracing::instrument(level = "debug", skip_all, fields(operations = ops.len()))]
    pub fn run(
        &mut self,
        ops: &[RowOperation],
        cells: &mut CellArena,
        executor: &mut dyn StatementExecutor,
    ) -> Result<()> {
        let mut open: Option<OpenGroup> = None;

        for (index, op) in ops.iter().enumerate() {
            if op.suppressed {
                tracing::debug!(
                    operation = %op.describe(),
                    "Skipping insert cancelled by a delete of the same row"
                );
                continue;
            }
            if op.is_update() && op.values.is_empty() {
                tracing::warn!(operation = %op.describe(), "Dropping update with no changed columns");
                continue;
            }

            let table = self.table(op)?;
            let must_close = open.as_ref().is_some_and(|group| {
                group.store != table.store
                    || (self.config.max_batch_size > 0
                        && group.statements.len() >= self.config.max_batch_size)
                    || depends_on(op, &group.produces, cells)
            });
            if must_close {
                if let Some(group) = open.take() {
                    self.flush_group(group, ops, cells, executor)?;
                }
            }

            let (statement, generated) = materialize(op, table, cells)?;
            let group = open.get_or_insert_with(|| OpenGroup::new(table.store));
            for (_, cell) in &generated {
                group.produces.insert(cells.root(*cell));
            }
            group.statements.push(statement);
            group.planned.push(Planned {
                index,
                locked: op.is_locked(),
                generated,
            });

            if op.is_locked() {
                if let Some(group) = open.take() {
                    self.flush_group(group, ops, cells, executor)?;
                }
            }
        }

        if let Some(group) = open.take() {
            self.flush_group(group, ops, cells, executor)?;
        }
        Ok(())
    }

    fn table(&self, op: &RowOperation) -> Result<&'a TableInfo> {
        self.mappings.table(op.table).ok_or_else(|| {
            Error::UnsupportedGraphShape(GraphShapeError::new(
                op.owner.as_ref(),
                format!("table '{}' is not mapped", op.table),
            ))
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(store = group.store, statements = group.statements.len()))]
    fn flush_group(
        &mut self,
        group: OpenGroup,
        ops: &[RowOperation],
        cells: &mut CellArena,
        executor: &mut dyn StatementExecutor,
    ) -> Result<()> {
        let OpenGroup {
            store,
            statements,
            planned,
            ..
        } = group;
        let group = StatementGroup { store, statements };

        tracing::debug!(store = store, count = group.len(), "Executing statement group");
        if self.config.log_statements {
            for statement in group.iter() {
                let (sql, params) = statement.to_sql();
                tracing::trace!(
                    sql = %sql,
                    params = %serde_json::to_string(&params).unwrap_or_default(),
                    "Executing statement"
                );
            }
        }

        let results = executor.execute(&group).map_err(|err| {
            let err = match (group.statements.as_slice(), planned.as_slice()) {
                ([statement], [plan]) => err
                    .with_context(statement.table(), ops[plan.index].owner.as_ref())
                    .with_sql(statement.to_sql().0),
                _ => err,
            };
            Error::Execution(err)
        })?;

        if results.len() != group.len() {
            return Err(Error::Execution(ExecutionError::new(
                ExecutionErrorKind::RowCount,
                format!(
                    "executor returned {} results for {} statements",
                    results.len(),
                    group.len()
                ),
            )));
        }

        self.counts.groups += 1;
        for ((statement, plan), result) in group.statements.iter().zip(&planned).zip(results) {
            let op = &ops[plan.index];
            let columns = self.apply_result(statement, plan, op, result, cells)?;
            match statement.kind() {
                OperationKind::Insert => self.counts.inserted += 1,
                OperationKind::Update => self.counts.updated += 1,
                OperationKind::Delete => self.counts.deleted += 1,
            }
            self.executed.push(ExecutedRow {
                index: plan.index,
                columns,
            });
        }
        Ok(())
    }

    fn apply_result(
        &self,
        statement: &Statement,
        plan: &Planned,
        op: &RowOperation,
        result: StatementResult,
        cells: &mut CellArena,
    ) -> Result<RowSnapshot> {
        let mut columns = RowSnapshot::new();
        match statement {
            Statement::Insert {
                table,
                columns: written,
                ..
            } => {
                for (col, value) in written {
                    columns.insert(*col, value.clone());
                }
                for (col, cell) in &plan.generated {
                    let value = result.generated_keys.get(col).cloned().ok_or_else(|| {
                        ExecutionError::new(
                            ExecutionErrorKind::RowCount,
                            format!("store returned no generated value for {}.{}", table, col),
                        )
                        .with_context(*table, op.owner.as_ref())
                        .with_sql(statement.to_sql().0)
                    })?;
                    cells.resolve(*cell, value.clone());
                    columns.insert(*col, value);
                }
            }
            Statement::Update {
                table,
                set,
                qualifier,
            } => {
                self.check_affected(statement, *table, qualifier, plan, op, &result)?;
                for (col, value) in set {
                    columns.insert(*col, value.clone());
                }
            }
            Statement::Delete { table, qualifier } => {
                self.check_affected(statement, *table, qualifier, plan, op, &result)?;
                for (col, value) in qualifier {
                    columns.insert(*col, value.clone());
                }
            }
        }
        Ok(columns)
    }

    fn check_affected(
        &self,
        statement: &Statement,
        table: &'static str,
        qualifier: &[(&'static str, Value)],
        plan: &Planned,
        op: &RowOperation,
        result: &StatementResult,
    ) -> Result<()> {
        if result.rows_affected > 0 {
            return Ok(());
        }
        if plan.locked {
            return Err(Error::OptimisticLock(OptimisticLockError {
                table,
                object: op.owner.clone(),
                qualifier: qualifier.to_vec(),
                sql: Some(statement.to_sql().0),
            }));
        }
        if self.config.strict_row_counts {
            return Err(Error::Execution(
                ExecutionError::new(
                    ExecutionErrorKind::RowCount,
                    format!("{} matched no rows", statement.kind()),
                )
                .with_context(table, op.owner.as_ref())
                .with_sql(statement.to_sql().0),
            ));
        }
        tracing::debug!(operation = %op.describe(), "Statement matched no rows");
        Ok(())
    }
}

/// Whether `op` reads a key that the open group has yet to generate.
fn depends_on(op: &RowOperation, produces: &HashSet<CellId>, cells: &CellArena) -> bool {
    if produces.is_empty() {
        return false;
    }
    op.identity
        .key
        .values()
        .chain(op.values.values().map(|w| &w.value))
        .any(|value| match value.deref(cells) {
            Deref::Pending(root) => produces.contains(&root),
            Deref::Resolved(_) => false,
        })
}

fn missing_key(op: &RowOperation, column: &'static str, message: &str) -> Error {
    Error::MissingPrimaryKey(KeyError {
        table: op.table,
        column: Some(column),
        object: op.owner.clone(),
        message: message.to_string(),
    })
}

fn literal(
    op: &RowOperation,
    column: &'static str,
    value: &ColumnValue,
    cells: &CellArena,
) -> Result<Value> {
    value
        .deref(cells)
        .value()
        .cloned()
        .ok_or_else(|| missing_key(op, column, "value still pending at execution"))
}

/// Key columns followed by locking columns, with expected values.
fn qualifier(
    op: &RowOperation,
    table: &TableInfo,
    cells: &CellArena,
) -> Result<Vec<(&'static str, Value)>> {
    let mut qualifier = Vec::with_capacity(table.primary_key.len() + op.locks.len());
    for key in &table.primary_key {
        let value = op
            .identity
            .key
            .get(key.name)
            .ok_or_else(|| missing_key(op, key.name, "no key value"))?;
        qualifier.push((key.name, literal(op, key.name, value, cells)?));
    }
    for (col, expected) in &op.locks {
        if !table.is_key_column(col) {
            qualifier.push((*col, expected.clone()));
        }
    }
    Ok(qualifier)
}

type Materialized = (Statement, Vec<(&'static str, CellId)>);

/// Build the statement for one operation.
pub(crate) fn materialize(
    op: &RowOperation,
    table: &TableInfo,
    cells: &CellArena,
) -> Result<Materialized> {
    match op.kind {
        OperationKind::Insert => {
            let mut columns = Vec::new();
            let mut returning = Vec::new();
            let mut generated = Vec::new();
            for key in &table.primary_key {
                let value = op
                    .identity
                    .key
                    .get(key.name)
                    .ok_or_else(|| missing_key(op, key.name, "no key value"))?;
                match (value.deref(cells), value) {
                    (Deref::Resolved(v), _) => columns.push((key.name, v.clone())),
                    (Deref::Pending(_), ColumnValue::Cell(cell)) if key.auto_increment => {
                        returning.push(key.name);
                        generated.push((key.name, *cell));
                    }
                    (Deref::Pending(_), _) => {
                        return Err(missing_key(op, key.name, "key still temporary at execution"));
                    }
                }
            }
            for (col, write) in &op.values {
                if table.is_key_column(col) {
                    continue;
                }
                columns.push((*col, literal(op, *col, &write.value, cells)?));
            }
            Ok((
                Statement::Insert {
                    table: op.table,
                    columns,
                    returning,
                },
                generated,
            ))
        }
        OperationKind::Update => {
            let set = op
                .values
                .iter()
                .map(|(col, write)| Ok((*col, literal(op, *col, &write.value, cells)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok((
                Statement::Update {
                    table: op.table,
                    set,
                    qualifier: qualifier(op, table, cells)?,
                },
                Vec::new(),
            ))
        }
        OperationKind::Delete => Ok((
            Statement::Delete {
                table: op.table,
                qualifier: qualifier(op, table, cells)?,
            },
            Vec::new(),
        )),
    }
}
