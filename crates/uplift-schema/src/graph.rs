//! Foreign-key relationship graph
//!
//! The graph is built once per session from `INFORMATION_SCHEMA` and answers
//! three questions the engine keeps asking: which tables are FK-connected to
//! a given table, what order a set of tables must be altered in, and which
//! tables become unalterable when the user skips one.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use uplift_core::{Connection, Result};

/// FK adjacency for one schema.
///
/// Holds both an undirected view (for reachability) and a directed
/// child-to-parents view (for topological ordering). Views never appear:
/// only BASE TABLE relationships are loaded.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    /// Undirected adjacency, both directions of every FK edge
    undirected: IndexMap<String, IndexSet<String>>,
    /// Directed adjacency, child table to the parents it references
    parents: IndexMap<String, IndexSet<String>>,
}

impl RelationshipGraph {
    /// Build the graph from the FK catalog of `schema`
    pub async fn load(conn: &dyn Connection, schema: &str) -> Result<Self> {
        let sql = format!(
            "SELECT \
                kcu.TABLE_NAME as CHILD_TABLE, \
                kcu.REFERENCED_TABLE_NAME as PARENT_TABLE \
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
            JOIN INFORMATION_SCHEMA.TABLES t_child \
                ON kcu.TABLE_NAME = t_child.TABLE_NAME \
                AND kcu.TABLE_SCHEMA = t_child.TABLE_SCHEMA \
            JOIN INFORMATION_SCHEMA.TABLES t_parent \
                ON kcu.REFERENCED_TABLE_NAME = t_parent.TABLE_NAME \
                AND kcu.TABLE_SCHEMA = t_parent.TABLE_SCHEMA \
            WHERE kcu.TABLE_SCHEMA = '{schema}' \
                AND kcu.REFERENCED_TABLE_NAME IS NOT NULL \
                AND t_child.TABLE_TYPE = 'BASE TABLE' \
                AND t_parent.TABLE_TYPE = 'BASE TABLE' \
            ORDER BY kcu.TABLE_NAME, kcu.REFERENCED_TABLE_NAME"
        );

        let result = conn.query(&sql).await?;
        let mut graph = Self::default();
        for row in &result.rows {
            if let (Some(child), Some(parent)) =
                (row.get_str("CHILD_TABLE"), row.get_str("PARENT_TABLE"))
            {
                graph.add_edge(child, parent);
            }
        }
        debug!(
            schema,
            tables = graph.undirected.len(),
            "built relationship graph"
        );
        Ok(graph)
    }

    /// Build from explicit child-references-parent edges
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut graph = Self::default();
        for (child, parent) in edges {
            graph.add_edge(child, parent);
        }
        graph
    }

    fn add_edge(&mut self, child: &str, parent: &str) {
        self.undirected
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
        self.undirected
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        self.parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    /// All tables FK-reachable from `start`, in either direction, excluding
    /// `start` itself. Empty when the table has no FK relationships.
    pub fn related_tables(&self, start: &str) -> IndexSet<String> {
        let mut related = IndexSet::new();
        if !self.undirected.contains_key(start) {
            return related;
        }

        let mut visited: IndexSet<&str> = IndexSet::new();
        visited.insert(start);
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = self.undirected.get(current) {
                for neighbor in neighbors {
                    if visited.insert(neighbor) {
                        related.insert(neighbor.clone());
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        related
    }

    /// Order `tables` so every parent precedes its children (Kahn's
    /// algorithm over the subgraph induced by `tables`).
    ///
    /// Ties are broken by the iteration order of `tables`, so the result is
    /// deterministic for the same input ordering. Tables caught in a
    /// reference cycle have no valid order; they are appended at the end in
    /// input order rather than dropped.
    pub fn topological_order(&self, tables: &IndexSet<String>) -> Vec<String> {
        let mut in_degree: IndexMap<&str, usize> =
            tables.iter().map(|t| (t.as_str(), 0)).collect();

        for child in tables {
            if let Some(parents) = self.parents.get(child) {
                let within = parents.iter().filter(|p| tables.contains(*p)).count();
                in_degree[child.as_str()] = within;
            }
        }

        let mut queue: VecDeque<&str> = tables
            .iter()
            .filter(|t| in_degree[t.as_str()] == 0)
            .map(String::as_str)
            .collect();
        let mut result: Vec<String> = Vec::with_capacity(tables.len());
        let mut placed: IndexSet<&str> = IndexSet::new();

        while let Some(current) = queue.pop_front() {
            result.push(current.to_string());
            placed.insert(current);

            for child in tables {
                let references_current = self
                    .parents
                    .get(child)
                    .is_some_and(|parents| parents.contains(current));
                if references_current {
                    let degree = &mut in_degree[child.as_str()];
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        // Cycles leave tables with nonzero in-degree
        for table in tables {
            if !placed.contains(table.as_str()) {
                result.push(table.clone());
            }
        }

        result
    }

    /// Tables that reference `table` directly
    pub fn children(&self, table: &str) -> IndexSet<String> {
        self.parents
            .iter()
            .filter(|(_, parents)| parents.contains(table))
            .map(|(child, _)| child.clone())
            .collect()
    }

    /// Tables that `table` references directly
    pub fn table_parents(&self, table: &str) -> IndexSet<String> {
        self.parents.get(table).cloned().unwrap_or_default()
    }

    /// When the user skips `table_to_skip`, every FK-connected table within
    /// `target_tables` must be skipped with it: a child cannot convert while
    /// its parent keeps the old charset, and a parent converted without its
    /// children leaves the constraint mismatched. BFS over both directions,
    /// restricted to `target_tables`; the skipped table itself is excluded
    /// from the result.
    pub fn cascade_skip_tables(
        &self,
        table_to_skip: &str,
        target_tables: &IndexSet<String>,
    ) -> IndexSet<String> {
        let mut cascade_skip = IndexSet::new();
        let mut visited: IndexSet<String> = IndexSet::new();
        visited.insert(table_to_skip.to_string());
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(table_to_skip.to_string());

        while let Some(current) = queue.pop_front() {
            for child in self.children(&current) {
                if target_tables.contains(&child) && visited.insert(child.clone()) {
                    cascade_skip.insert(child.clone());
                    queue.push_back(child);
                }
            }
            for parent in self.table_parents(&current) {
                if target_tables.contains(&parent) && visited.insert(parent.clone()) {
                    cascade_skip.insert(parent.clone());
                    queue.push_back(parent);
                }
            }
        }

        cascade_skip
    }
}
