//! Batch charset-fix planning
//!
//! Expands the flagged tables into their full FK closure, annotates each
//! table with its current charset and FK neighbours, and lets the caller
//! exclude tables before the FK-safe script is generated.

use indexmap::IndexSet;
use serde::Serialize;
use tracing::debug;

use uplift_core::{Connection, Result};
use uplift_schema::{MetadataCache, RelationshipGraph};

use crate::safe_change::{FkSafeCharsetChanger, SafeChangeScript};
use crate::{TARGET_CHARSET, TARGET_COLLATION};

/// One table in the batch charset plan
#[derive(Debug, Clone, Serialize)]
pub struct CharsetTableInfo {
    pub table_name: String,
    pub current_charset: String,
    pub current_collation: String,
    /// Tables this one references
    pub fk_parents: Vec<String>,
    /// Tables referencing this one
    pub fk_children: Vec<String>,
    /// Whether the table itself was flagged, or only pulled in by an FK
    pub is_original_issue: bool,
    pub skip: bool,
}

/// Builds the charset-fix plan for a set of flagged tables
pub struct CharsetFixPlanBuilder<'a> {
    conn: &'a dyn Connection,
    graph: &'a RelationshipGraph,
    metadata: &'a MetadataCache,
    schema: String,
}

impl<'a> CharsetFixPlanBuilder<'a> {
    pub fn new(
        conn: &'a dyn Connection,
        graph: &'a RelationshipGraph,
        metadata: &'a MetadataCache,
        schema: &str,
    ) -> Self {
        Self {
            conn,
            graph,
            metadata,
            schema: schema.to_string(),
        }
    }

    /// The flagged tables plus their whole FK closure, topologically
    /// ordered (parents first), each annotated with charset and neighbours
    pub async fn build_full_table_list(
        &self,
        issue_tables: &[String],
    ) -> Result<Vec<CharsetTableInfo>> {
        let mut all_tables: IndexSet<String> = issue_tables.iter().cloned().collect();
        for table in issue_tables {
            all_tables.extend(self.graph.related_tables(table));
        }
        let ordered = self.graph.topological_order(&all_tables);

        let mut list = Vec::with_capacity(ordered.len());
        for table in ordered {
            let charset = self.metadata.table_charset(self.conn, &table).await?;
            let (current_charset, current_collation) = match charset {
                Some(c) => (c.charset, c.collation),
                None => ("unknown".to_string(), "unknown".to_string()),
            };
            list.push(CharsetTableInfo {
                fk_parents: self.graph.table_parents(&table).into_iter().collect(),
                fk_children: self.graph.children(&table).into_iter().collect(),
                is_original_issue: issue_tables.contains(&table),
                skip: false,
                table_name: table,
                current_charset,
                current_collation,
            });
        }

        debug!(
            flagged = issue_tables.len(),
            total = list.len(),
            "built charset plan table list"
        );
        Ok(list)
    }

    /// Tables that must also be excluded when the user skips one: its FK
    /// neighbourhood closure restricted to the plan's table set
    pub fn tables_to_skip_with(
        &self,
        table_to_skip: &str,
        plan: &[CharsetTableInfo],
    ) -> IndexSet<String> {
        let target: IndexSet<String> =
            plan.iter().map(|info| info.table_name.clone()).collect();
        self.graph.cascade_skip_tables(table_to_skip, &target)
    }

    /// Apply a user exclusion to the plan, marking the table and its
    /// cascade-skip closure
    pub fn exclude_table(&self, table_to_skip: &str, plan: &mut [CharsetTableInfo]) {
        let cascade = self.tables_to_skip_with(table_to_skip, plan);
        for info in plan.iter_mut() {
            if info.table_name == table_to_skip || cascade.contains(&info.table_name) {
                info.skip = true;
            }
        }
    }

    /// FK-safe conversion script for the tables that survived exclusion
    pub async fn generate_fix_script(
        &self,
        plan: &[CharsetTableInfo],
    ) -> Result<SafeChangeScript> {
        let surviving: IndexSet<String> = plan
            .iter()
            .filter(|info| !info.skip)
            .map(|info| info.table_name.clone())
            .collect();

        let changer = FkSafeCharsetChanger::new(self.conn, self.graph, &self.schema);
        changer
            .generate_script(&surviving, TARGET_CHARSET, TARGET_COLLATION)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uplift_core::{QueryResult, Value, mock::MockConnection};

    fn chain_graph() -> RelationshipGraph {
        RelationshipGraph::from_edges([("orders", "customers"), ("customers", "regions")])
    }

    fn script_charset(conn: &MockConnection) {
        conn.script_query(
            "COLLATION_CHARACTER_SET_APPLICABILITY",
            QueryResult::new(
                vec!["CHARACTER_SET_NAME", "TABLE_COLLATION"],
                vec![vec![
                    Value::from("utf8mb3"),
                    Value::from("utf8mb3_general_ci"),
                ]],
            ),
        );
    }

    #[tokio::test]
    async fn full_list_covers_the_fk_closure_in_topological_order() {
        let conn = MockConnection::new();
        script_charset(&conn);
        let graph = chain_graph();
        let metadata = MetadataCache::new("shop");
        let builder = CharsetFixPlanBuilder::new(&conn, &graph, &metadata, "shop");

        let plan = builder
            .build_full_table_list(&["orders".to_string()])
            .await
            .unwrap();

        let names: Vec<&str> = plan.iter().map(|i| i.table_name.as_str()).collect();
        assert_eq!(names, vec!["regions", "customers", "orders"]);
        assert!(plan[2].is_original_issue);
        assert!(!plan[0].is_original_issue);
        assert_eq!(plan[2].fk_parents, vec!["customers"]);
        assert_eq!(plan[1].fk_children, vec!["orders"]);
        assert_eq!(plan[0].current_charset, "utf8mb3");
    }

    #[tokio::test]
    async fn excluding_a_middle_table_skips_its_direct_neighbours_only() {
        let conn = MockConnection::new();
        script_charset(&conn);
        let graph = chain_graph();
        let metadata = MetadataCache::new("shop");
        let builder = CharsetFixPlanBuilder::new(&conn, &graph, &metadata, "shop");

        let mut plan = builder
            .build_full_table_list(&["orders".to_string()])
            .await
            .unwrap();
        builder.exclude_table("customers", &mut plan);

        // Everything FK-connected to customers inside the plan gets skipped
        let skipped: Vec<&str> = plan
            .iter()
            .filter(|i| i.skip)
            .map(|i| i.table_name.as_str())
            .collect();
        assert_eq!(skipped, vec!["regions", "customers", "orders"]);
    }

    #[tokio::test]
    async fn cascade_skip_is_restricted_to_the_plan() {
        let conn = MockConnection::new();
        script_charset(&conn);
        let graph = RelationshipGraph::from_edges([
            ("orders", "customers"),
            ("invoices", "customers"),
        ]);
        let metadata = MetadataCache::new("shop");
        let builder = CharsetFixPlanBuilder::new(&conn, &graph, &metadata, "shop");

        let mut plan = builder
            .build_full_table_list(&["orders".to_string(), "customers".to_string()])
            .await
            .unwrap();
        plan.retain(|info| info.table_name != "invoices");
        builder.exclude_table("customers", &mut plan);

        assert!(plan.iter().all(|info| info.skip));
        assert!(!plan.iter().any(|info| info.table_name == "invoices"));
    }

    #[tokio::test]
    async fn fix_script_covers_only_surviving_tables() {
        let conn = MockConnection::new();
        script_charset(&conn);
        let graph = chain_graph();
        let metadata = MetadataCache::new("shop");
        let builder = CharsetFixPlanBuilder::new(&conn, &graph, &metadata, "shop");

        let mut plan = builder
            .build_full_table_list(&["orders".to_string()])
            .await
            .unwrap();
        for info in plan.iter_mut() {
            if info.table_name == "regions" {
                info.skip = true;
            }
        }

        let script = builder.generate_fix_script(&plan).await.unwrap();
        assert_eq!(script.table_count(), 2);
        assert!(!script.full_sql().contains("`regions` CONVERT"));
    }
}
