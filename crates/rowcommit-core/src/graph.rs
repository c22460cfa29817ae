//! Table dependency ordering.
//!
//! Foreign keys induce a partial order over tables: a referenced table must
//! be written before the table referencing it. [`DependencyGraph`] is the
//! seam the sorter consumes; [`TableGraph`] derives one from an
//! [`EntityResolver`].

use crate::mapping::EntityResolver;
use indexmap::{IndexMap, IndexSet};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Partial order over tables derived from foreign keys.
pub trait DependencyGraph {
    /// `Less` when `a` must be written before `b` (a is an ancestor of b).
    ///
    /// Tables with no order between them compare `Equal`; the sorter keeps
    /// their incoming order.
    fn compare(&self, a: &str, b: &str) -> Ordering;

    /// Whether the table has a foreign key onto itself.
    fn is_self_referencing(&self, table: &str) -> bool;
}

/// A [`DependencyGraph`] built from relationship metadata.
///
/// Each table gets a rank one greater than the highest rank of the tables it
/// references. Tables of equal rank are unordered.
#[derive(Debug, Clone, Default)]
pub struct TableGraph {
    /// table -> tables it references
    parents: IndexMap<&'static str, IndexSet<&'static str>>,
    self_referencing: HashSet<&'static str>,
    ranks: IndexMap<&'static str, usize>,
}

impl TableGraph {
    /// Derive the graph from every segment known to the resolver.
    pub fn from_resolver(resolver: &EntityResolver) -> Self {
        let mut graph = Self::default();
        for table in resolver.tables() {
            graph.add_table(table.name);
        }
        for seg in resolver.segments() {
            graph.add_dependency(seg.dependent_table(), seg.parent_table());
        }
        graph.compute_ranks();
        graph
    }

    fn add_table(&mut self, table: &'static str) {
        self.parents.entry(table).or_default();
    }

    fn add_dependency(&mut self, child: &'static str, parent: &'static str) {
        if child == parent {
            self.self_referencing.insert(child);
            return;
        }
        self.add_table(parent);
        self.parents.entry(child).or_default().insert(parent);
    }

    /// Whether `child` holds a foreign key onto `parent`.
    pub fn depends_on(&self, child: &str, parent: &str) -> bool {
        self.parents
            .get(child)
            .is_some_and(|deps| deps.contains(parent))
    }

    /// Topological rank of a table; unknown tables rank 0.
    pub fn rank(&self, table: &str) -> usize {
        self.ranks.get(table).copied().unwrap_or(0)
    }

    /// Find a dependency cycle between distinct tables, if one exists.
    ///
    /// The returned path starts and ends at the same table.
    pub fn find_cycle(&self) -> Option<Vec<&'static str>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for &table in self.parents.keys() {
            if !visited.contains(table)
                && self.cycle_dfs(table, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path);
            }
        }
        None
    }

    fn cycle_dfs(
        &self,
        table: &'static str,
        visited: &mut HashSet<&'static str>,
        rec_stack: &mut HashSet<&'static str>,
        path: &mut Vec<&'static str>,
    ) -> bool {
        visited.insert(table);
        rec_stack.insert(table);
        path.push(table);

        if let Some(deps) = self.parents.get(table) {
            for &dep in deps {
                if !visited.contains(dep) {
                    if self.cycle_dfs(dep, visited, rec_stack, path) {
                        return true;
                    }
                } else if rec_stack.contains(dep) {
                    path.push(dep);
                    return true;
                }
            }
        }

        rec_stack.remove(table);
        path.pop();
        false
    }

    fn compute_ranks(&mut self) {
        if let Some(cycle) = self.find_cycle() {
            tracing::warn!(
                cycle = ?cycle,
                "foreign key cycle between tables; ordering inside the cycle is arbitrary"
            );
        }

        let mut ranks = IndexMap::new();
        let mut on_stack = HashSet::new();
        let tables: Vec<&'static str> = self.parents.keys().copied().collect();
        for table in tables {
            self.rank_dfs(table, &mut ranks, &mut on_stack);
        }
        self.ranks = ranks;
    }

    fn rank_dfs(
        &self,
        table: &'static str,
        ranks: &mut IndexMap<&'static str, usize>,
        on_stack: &mut HashSet<&'static str>,
    ) -> usize {
        if let Some(&rank) = ranks.get(table) {
            return rank;
        }
        on_stack.insert(table);

        let mut rank = 0;
        if let Some(deps) = self.parents.get(table) {
            for &dep in deps {
                // back edge of a cycle contributes nothing
                if on_stack.contains(dep) {
                    continue;
                }
                rank = rank.max(self.rank_dfs(dep, ranks, on_stack) + 1);
            }
        }

        on_stack.remove(table);
        ranks.insert(table, rank);
        rank
    }
}

impl DependencyGraph for TableGraph {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        self.rank(a).cmp(&self.rank(b))
    }

    fn is_self_referencing(&self, table: &str) -> bool {
        self.self_referencing.contains(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{EntityMapping, JoinSegment, RelationshipInfo, TableInfo};

    fn fixture() -> EntityResolver {
        EntityResolver::new()
            .with_table(TableInfo::new("galleries").generated_key("id"))
            .with_table(TableInfo::new("artists").generated_key("id"))
            .with_table(TableInfo::new("paintings").generated_key("id"))
            .with_entity(
                EntityMapping::new("Painting", "paintings")
                    .relationship(RelationshipInfo::new(
                        "artist",
                        "Artist",
                        JoinSegment::to_one("paintings", "artist_id", "artists", "id"),
                    ))
                    .relationship(RelationshipInfo::new(
                        "gallery",
                        "Gallery",
                        JoinSegment::to_one("paintings", "gallery_id", "galleries", "id"),
                    )),
            )
            .with_entity(EntityMapping::new("Artist", "artists").relationship(
                RelationshipInfo::new(
                    "mentor",
                    "Artist",
                    JoinSegment::to_one("artists", "mentor_id", "artists", "id"),
                ),
            ))
    }

    #[test]
    fn test_parent_before_child() {
        let graph = TableGraph::from_resolver(&fixture());
        assert_eq!(graph.compare("artists", "paintings"), Ordering::Less);
        assert_eq!(graph.compare("paintings", "galleries"), Ordering::Greater);
        assert!(graph.depends_on("paintings", "artists"));
        assert!(!graph.depends_on("artists", "paintings"));
    }

    #[test]
    fn test_unrelated_tables_are_unordered() {
        let graph = TableGraph::from_resolver(&fixture());
        assert_eq!(graph.rank("artists"), graph.rank("galleries"));
        assert_eq!(graph.compare("artists", "galleries"), Ordering::Equal);
        assert_eq!(graph.compare("galleries", "artists"), Ordering::Equal);
    }

    #[test]
    fn test_self_reference() {
        let graph = TableGraph::from_resolver(&fixture());
        assert!(graph.is_self_referencing("artists"));
        assert!(!graph.is_self_referencing("paintings"));
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_cycle_detected_and_ranked() {
        let mut graph = TableGraph::default();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "a");
        graph.compute_ranks();

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        // still a total order
        assert_ne!(graph.compare("a", "b"), Ordering::Equal);
    }
}
