//! Entity mapping metadata.
//!
//! The flush engine never loads mapping metadata itself; callers describe
//! their schema with these types and hand an [`EntityResolver`] to the
//! engine. Names are `&'static str` throughout, like `FieldInfo` in the
//! query layer, so metadata can live in statics.
//!
//! # Relationship shape
//!
//! A relationship is a path of one or more [`JoinSegment`]s. A single segment
//! is an ordinary foreign key; a multi-segment path is a flattened
//! relationship running through intermediate join tables. Each segment
//! records which side owns the foreign key:
//!
//! | Constructor | FK side | Meaning |
//! |-------------|---------|---------|
//! | `to_one` | source | `source.fk → target.pk` |
//! | `to_many` | target | `target.fk → source.pk` |
//! | `to_dependent_pk` | target | `target.pk` is copied from `source.pk` |

use indexmap::IndexMap;

/// Which end of a [`JoinSegment`] holds the foreign key columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FkSide {
    Source,
    Target,
}

/// One hop of a relationship: a foreign key between two tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSegment {
    pub source_table: &'static str,
    pub target_table: &'static str,
    /// `(source column, target column)` pairs.
    pub joins: Vec<(&'static str, &'static str)>,
    pub fk: FkSide,
    pub to_many: bool,
    /// The target's primary key is derived from the source's primary key.
    pub to_dependent_pk: bool,
}

impl JoinSegment {
    /// `source.source_column` references `target.target_column`.
    pub fn to_one(
        source_table: &'static str,
        source_column: &'static str,
        target_table: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            source_table,
            target_table,
            joins: vec![(source_column, target_column)],
            fk: FkSide::Source,
            to_many: false,
            to_dependent_pk: false,
        }
    }

    /// `target.target_column` references `source.source_column`.
    pub fn to_many(
        source_table: &'static str,
        source_column: &'static str,
        target_table: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            source_table,
            target_table,
            joins: vec![(source_column, target_column)],
            fk: FkSide::Target,
            to_many: true,
            to_dependent_pk: false,
        }
    }

    /// `target.target_column` is a key column copied from `source.source_column`.
    pub fn to_dependent_pk(
        source_table: &'static str,
        source_column: &'static str,
        target_table: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            source_table,
            target_table,
            joins: vec![(source_column, target_column)],
            fk: FkSide::Target,
            to_many: false,
            to_dependent_pk: true,
        }
    }

    /// Add another column pair for a composite key.
    #[must_use]
    pub fn join(mut self, source_column: &'static str, target_column: &'static str) -> Self {
        self.joins.push((source_column, target_column));
        self
    }

    /// Table holding the foreign key columns.
    pub const fn dependent_table(&self) -> &'static str {
        match self.fk {
            FkSide::Source => self.source_table,
            FkSide::Target => self.target_table,
        }
    }

    /// Table whose key the foreign key points at.
    pub const fn parent_table(&self) -> &'static str {
        match self.fk {
            FkSide::Source => self.target_table,
            FkSide::Target => self.source_table,
        }
    }

    /// `(fk column, referenced column)` pairs regardless of direction.
    pub fn fk_pairs(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.joins.iter().map(move |&(src, tgt)| match self.fk {
            FkSide::Source => (src, tgt),
            FkSide::Target => (tgt, src),
        })
    }

    /// Whether both ends are the same table.
    pub fn is_reflexive(&self) -> bool {
        self.source_table == self.target_table
    }
}

/// A primary key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: &'static str,
    /// The store assigns this column on insert (identity/auto-increment).
    pub auto_increment: bool,
}

/// A physical table the engine may write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: &'static str,
    /// Backing store (data node) the table lives in.
    pub store: &'static str,
    /// Key columns in declared order.
    pub primary_key: Vec<KeyColumn>,
}

impl TableInfo {
    /// Create a table in the default store with no key columns yet.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            store: "default",
            primary_key: Vec::new(),
        }
    }

    /// Set the backing store.
    #[must_use]
    pub fn store(mut self, store: &'static str) -> Self {
        self.store = store;
        self
    }

    /// Append a key column the engine has to supply.
    #[must_use]
    pub fn key(mut self, column: &'static str) -> Self {
        self.primary_key.push(KeyColumn {
            name: column,
            auto_increment: false,
        });
        self
    }

    /// Append a key column the store generates on insert.
    #[must_use]
    pub fn generated_key(mut self, column: &'static str) -> Self {
        self.primary_key.push(KeyColumn {
            name: column,
            auto_increment: true,
        });
        self
    }

    pub fn key_column(&self, column: &str) -> Option<&KeyColumn> {
        self.primary_key.iter().find(|k| k.name == column)
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key_column(column).is_some()
    }

    pub fn key_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.primary_key.iter().map(|k| k.name)
    }
}

/// An object property mapped to a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name: &'static str,
    pub column: &'static str,
    /// Empty for columns of the entity's own table. Otherwise a chain of
    /// to-one dependent-PK segments leading to the table holding `column`.
    pub path: Vec<JoinSegment>,
}

impl AttributeInfo {
    pub fn new(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            column,
            path: Vec::new(),
        }
    }

    /// A flattened attribute stored in a secondary table.
    pub fn flattened(name: &'static str, column: &'static str, path: Vec<JoinSegment>) -> Self {
        Self { name, column, path }
    }

    pub fn is_flattened(&self) -> bool {
        !self.path.is_empty()
    }
}

/// An object-to-object relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: &'static str,
    pub target_entity: &'static str,
    /// The relationship on the target pointing back, if mapped.
    pub reverse: Option<&'static str>,
    pub path: Vec<JoinSegment>,
}

impl RelationshipInfo {
    pub fn new(name: &'static str, target_entity: &'static str, segment: JoinSegment) -> Self {
        Self {
            name,
            target_entity,
            reverse: None,
            path: vec![segment],
        }
    }

    /// A relationship running through intermediate join tables.
    pub fn flattened(
        name: &'static str,
        target_entity: &'static str,
        path: Vec<JoinSegment>,
    ) -> Self {
        Self {
            name,
            target_entity,
            reverse: None,
            path,
        }
    }

    #[must_use]
    pub fn reverse(mut self, name: &'static str) -> Self {
        self.reverse = Some(name);
        self
    }

    pub fn is_flattened(&self) -> bool {
        self.path.len() > 1
    }
}

/// Mapping of one entity onto its primary table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    pub name: &'static str,
    pub table: &'static str,
    pub attributes: Vec<AttributeInfo>,
    pub relationships: Vec<RelationshipInfo>,
    /// Columns checked by optimistic locking on update and delete.
    pub locking: Vec<&'static str>,
    pub read_only: bool,
}

impl EntityMapping {
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            attributes: Vec::new(),
            relationships: Vec::new(),
            locking: Vec::new(),
            read_only: false,
        }
    }

    /// Map a property onto a column of the entity's table.
    #[must_use]
    pub fn attribute(mut self, name: &'static str, column: &'static str) -> Self {
        self.attributes.push(AttributeInfo::new(name, column));
        self
    }

    /// Map a property onto a column of the entity's table and lock on it.
    #[must_use]
    pub fn locked_attribute(mut self, name: &'static str, column: &'static str) -> Self {
        self.attributes.push(AttributeInfo::new(name, column));
        self.locking.push(column);
        self
    }

    #[must_use]
    pub fn flattened_attribute(mut self, attribute: AttributeInfo) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// The property holding a key column's value, for meaningful keys.
    pub fn attribute_for_column(&self, column: &str) -> Option<&AttributeInfo> {
        self.attributes
            .iter()
            .find(|a| !a.is_flattened() && a.column == column)
    }
}

/// Registry of tables and entities consulted during a flush.
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    tables: IndexMap<&'static str, TableInfo>,
    entities: IndexMap<&'static str, EntityMapping>,
}

impl EntityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table (entity tables and join tables alike).
    #[must_use]
    pub fn with_table(mut self, table: TableInfo) -> Self {
        self.tables.insert(table.name, table);
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity: EntityMapping) -> Self {
        self.entities.insert(entity.name, entity);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityMapping> {
        self.entities.get(name)
    }

    /// The entity whose primary table is `table`, if any.
    pub fn entity_for_table(&self, table: &str) -> Option<&EntityMapping> {
        self.entities.values().find(|e| e.table == table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMapping> {
        self.entities.values()
    }

    /// Every segment of every relationship and flattened attribute.
    pub fn segments(&self) -> impl Iterator<Item = &JoinSegment> {
        self.entities.values().flat_map(|e| {
            e.relationships
                .iter()
                .flat_map(|r| r.path.iter())
                .chain(e.attributes.iter().flat_map(|a| a.path.iter()))
        })
    }

    /// Whether a key column takes its value from a foreign key rather than
    /// being assigned or generated.
    pub fn is_propagated(&self, table: &str, column: &str) -> bool {
        self.segments().any(|seg| {
            seg.dependent_table() == table && seg.fk_pairs().any(|(fk, _)| fk == column)
        })
    }

    /// The reflexive to-one segment of a self-referencing table, if any.
    ///
    /// The returned segment's FK side is the child; its target is the parent.
    pub fn reflexive_segment(&self, table: &str) -> Option<&JoinSegment> {
        self.segments()
            .find(|seg| seg.is_reflexive() && seg.source_table == table && !seg.to_many)
    }
}
