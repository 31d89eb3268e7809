use super::*;
use uplift_core::{NullProgress, QueryResult, Value, mock::MockConnection};

fn set(tables: &[&str]) -> IndexSet<String> {
    tables.iter().map(|t| t.to_string()).collect()
}

fn chain_graph() -> RelationshipGraph {
    RelationshipGraph::from_edges([("orders", "customers"), ("customers", "regions")])
}

fn fk_row(
    constraint: &str,
    table: &str,
    column: &str,
    ref_table: &str,
    ref_column: &str,
) -> Vec<Value> {
    vec![
        Value::from(constraint),
        Value::from(table),
        Value::from(column),
        Value::from(ref_table),
        Value::from(ref_column),
        Value::from("RESTRICT"),
        Value::from("RESTRICT"),
    ]
}

fn script_chain_fks(conn: &MockConnection) {
    conn.script_query(
        "REFERENTIAL_CONSTRAINTS",
        QueryResult::new(
            vec![
                "CONSTRAINT_NAME",
                "TABLE_NAME",
                "COLUMN_NAME",
                "REFERENCED_TABLE_NAME",
                "REFERENCED_COLUMN_NAME",
                "DELETE_RULE",
                "UPDATE_RULE",
            ],
            vec![
                fk_row("fk_orders_customer", "orders", "customer_id", "customers", "id"),
                fk_row("fk_customers_region", "customers", "region_id", "regions", "id"),
            ],
        ),
    );
}

mod script_generation_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn script_orders_parents_first() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let script = changer
            .generate_script(
                &set(&["orders", "customers", "regions"]),
                "utf8mb4",
                "utf8mb4_unicode_ci",
            )
            .await
            .unwrap();

        assert_eq!(script.fk_count(), 2);
        assert_eq!(script.table_count(), 3);
        assert!(script.alter_tables[0].contains("`regions`"));
        assert!(script.alter_tables[1].contains("`customers`"));
        assert!(script.alter_tables[2].contains("`orders`"));
    }

    #[tokio::test]
    async fn full_sql_contains_phase_markers() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let script = changer
            .generate_script(&set(&["orders"]), "utf8mb4", "utf8mb4_unicode_ci")
            .await
            .unwrap();
        let sql = script.full_sql();
        assert!(sql.contains("Phase 1: drop foreign keys"));
        assert!(sql.contains("Phase 2: convert charset"));
        assert!(sql.contains("Phase 3: recreate foreign keys"));
    }

    #[tokio::test]
    async fn script_without_fks_notes_empty_phases() {
        let conn = MockConnection::new();
        let graph = RelationshipGraph::default();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let script = changer
            .generate_script(&set(&["standalone"]), "utf8mb4", "utf8mb4_unicode_ci")
            .await
            .unwrap();
        assert_eq!(script.fk_count(), 0);
        assert!(script.full_sql().contains("-- (no related foreign keys)"));
    }
}

mod execution_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn successful_run_executes_all_phases_with_commits() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let outcome = changer
            .execute(
                &set(&["orders", "customers", "regions"]),
                "utf8mb4",
                "utf8mb4_unicode_ci",
                &NullProgress,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.executed_drop.len(), 2);
        assert_eq!(outcome.executed_alter.len(), 3);
        assert_eq!(outcome.executed_add.len(), 2);
        assert!(outcome.recovery_sql.is_none());
        assert_eq!(conn.commit_count(), 3);
    }

    #[tokio::test]
    async fn phase_two_failure_yields_recovery_sql() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        // First conversion (regions) succeeds, second (customers) fails
        conn.fail_on_execute_nth("CONVERT TO CHARACTER SET", "disk full", 1);
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let outcome = changer
            .execute(
                &set(&["orders", "customers", "regions"]),
                "utf8mb4",
                "utf8mb4_unicode_ci",
                &NullProgress,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.executed_alter.len(), 1);
        assert_eq!(conn.rollback_count(), 1);

        let recovery = outcome.recovery_sql.expect("recovery document");
        assert!(recovery.contains("ADD CONSTRAINT `fk_orders_customer`"));
        assert!(recovery.contains("ADD CONSTRAINT `fk_customers_region`"));
        assert!(recovery.contains("disk full"));
        assert!(recovery.contains("FKs still missing: 2"));
    }

    #[tokio::test]
    async fn failed_run_auto_restores_dropped_fks() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        conn.fail_on_execute("CONVERT TO CHARACTER SET", "boom");
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let outcome = changer
            .execute(
                &set(&["orders", "customers", "regions"]),
                "utf8mb4",
                "utf8mb4_unicode_ci",
                &NullProgress,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert!(outcome.auto_recovered);
        let restored: Vec<String> = conn
            .executed_sql()
            .into_iter()
            .filter(|sql| sql.contains("ADD CONSTRAINT"))
            .collect();
        assert_eq!(restored.len(), 2);
    }

    #[tokio::test]
    async fn view_targets_are_skipped_not_fatal() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        conn.fail_on_execute("`customers` CONVERT", "'shop.customers' is not BASE TABLE");
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let outcome = changer
            .execute(
                &set(&["orders", "customers", "regions"]),
                "utf8mb4",
                "utf8mb4_unicode_ci",
                &NullProgress,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.skipped_views.len(), 1);
        assert_eq!(outcome.executed_alter.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_before_any_statement() {
        let conn = MockConnection::new();
        script_chain_fks(&conn);
        let graph = chain_graph();
        let changer = FkSafeCharsetChanger::new(&conn, &graph, "shop");

        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = changer
            .execute(
                &set(&["orders"]),
                "utf8mb4",
                "utf8mb4_unicode_ci",
                &NullProgress,
                &cancel,
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.executed_drop.is_empty());
    }
}
