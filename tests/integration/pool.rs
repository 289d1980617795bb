//! Live query execution tests against a real PostgreSQL server

use std::time::Duration;

use serde_json::json;

use pgfleet::pool::QueryOptions;

use crate::{skip_if_not_enabled, test_fixture, TEST_INSTANCE};

#[tokio::test]
async fn test_execute_simple_select() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let outcome = manager
        .execute_query(TEST_INSTANCE, "SELECT 1 AS one", &[], QueryOptions::default())
        .await
        .expect("query failed");

    assert_eq!(outcome.row_count, 1);
    assert_eq!(outcome.fields[0].name, "one");
    assert_eq!(outcome.rows[0]["one"], json!(1));
}

#[tokio::test]
async fn test_execute_with_params() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let outcome = manager
        .execute_query(
            TEST_INSTANCE,
            "SELECT $1::text AS greeting, $2::int8 AS n",
            &[json!("hello"), json!(42)],
            QueryOptions::default(),
        )
        .await
        .expect("query failed");

    assert_eq!(outcome.rows[0]["greeting"], json!("hello"));
    assert_eq!(outcome.rows[0]["n"], json!(42));
}

#[tokio::test]
async fn test_row_limit_appended() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let outcome = manager
        .execute_query(
            TEST_INSTANCE,
            "SELECT generate_series(1, 100) AS n",
            &[],
            QueryOptions {
                row_limit: Some(10),
                ..QueryOptions::default()
            },
        )
        .await
        .expect("query failed");

    assert_eq!(outcome.row_count, 10);
}

#[tokio::test]
async fn test_explain_plan_captured() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let outcome = manager
        .execute_query(
            TEST_INSTANCE,
            "SELECT 1",
            &[],
            QueryOptions {
                include_explain: true,
                ..QueryOptions::default()
            },
        )
        .await
        .expect("query failed");

    assert!(outcome.explain_plan.is_some());
}

#[tokio::test]
async fn test_statement_timeout_scoped_to_query() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let slow = manager
        .execute_query(
            TEST_INSTANCE,
            "SELECT pg_sleep(2)",
            &[],
            QueryOptions {
                timeout: Some(Duration::from_millis(100)),
                ..QueryOptions::default()
            },
        )
        .await;
    assert!(slow.is_err());

    // The timeout must not leak onto the next borrower's query
    let follow_up = manager
        .execute_query(TEST_INSTANCE, "SELECT pg_sleep(0.3)", &[], QueryOptions::default())
        .await;
    assert!(follow_up.is_ok());
}

#[tokio::test]
async fn test_checked_out_returns_to_zero_after_mixed_load() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        // Half the statements fail to parse server-side
        let sql = if i % 2 == 0 {
            "SELECT 1"
        } else {
            "SELECT FROM no_such_table_pgfleet"
        };
        handles.push(tokio::spawn(async move {
            let _ = manager
                .execute_query(TEST_INSTANCE, sql, &[], QueryOptions::default())
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = manager.stats().await;
    assert_eq!(stats.total_in_use, 0);
}

#[tokio::test]
async fn test_probe_reports_version() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    let check = manager.test_connection(TEST_INSTANCE).await;
    assert!(check.success, "probe failed: {}", check.message);
    assert!(check.version.unwrap().contains("PostgreSQL"));
}

#[tokio::test]
async fn test_refresh_pool_survives_queries() {
    skip_if_not_enabled!();
    let (manager, _) = test_fixture();

    manager
        .execute_query(TEST_INSTANCE, "SELECT 1", &[], QueryOptions::default())
        .await
        .expect("query failed");
    manager.refresh_pool(TEST_INSTANCE).await.expect("refresh failed");
    manager
        .execute_query(TEST_INSTANCE, "SELECT 1", &[], QueryOptions::default())
        .await
        .expect("query after refresh failed");
}
