use std::{sync::Arc, time::Duration};

use pgvacman_core::{
    Configuration, RunOptions, RunStatus, VacmanError,
    core::{
        catalog::{CandidateRelation, RelationKind},
        session::memory::{Contention, MemoryCatalog, MemoryProvider},
    },
    run,
};

const RULES: &str = r#"
matchgroups:
  - schema: "^archive$"
  - schema: "^public$"
    ruleset: sized
  - owner: "^reporting$"
    case_sensitive: false
    ruleset: views
rulesets:
  sized:
    - minrows: 0
      settings:
        autovacuum_vacuum_scale_factor: null
        fillfactor: 100
    - minrows: 1000000
      settings:
        autovacuum_vacuum_scale_factor: 0.01
        toast.autovacuum_enabled: false
  views:
    - minrows: 0
      settings:
        fillfactor: 90
"#;

fn config() -> Configuration {
    Configuration::from_yaml(RULES).unwrap()
}

fn table(oid: i64, schema: &str, name: &str, rows: u64) -> CandidateRelation {
    CandidateRelation::new(oid, RelationKind::Table, schema, name, "app", rows)
}

fn catalog() -> Arc<MemoryCatalog> {
    MemoryCatalog::new(vec![
        table(1, "archive", "events", 50_000_000),
        table(2, "public", "orders", 5_000_000).with_option("autovacuum_vacuum_scale_factor", "0.2"),
        table(3, "public", "customers", 20_000).with_option("autovacuum_vacuum_scale_factor", "0.05"),
        table(4, "public", "settled", 10).with_option("fillfactor", "100"),
        CandidateRelation::new(5, RelationKind::MaterializedView, "stats", "daily", "Reporting", 300),
    ])
}

fn options(jobs: usize) -> RunOptions {
    RunOptions {
        jobs,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_run_applies_and_is_idempotent() {
    let catalog = catalog();
    let provider = MemoryProvider::new(catalog.clone());

    let report = run(&provider, &config(), &options(2)).await.unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.stats.tables_matched, 5);
    assert_eq!(report.stats.tables_applied, 3);
    assert_eq!(report.stats.parameters_failed, 0);

    let orders = catalog.relation("public", "orders").unwrap();
    assert_eq!(orders.options["autovacuum_vacuum_scale_factor"], "0.01");
    assert_eq!(orders.options["toast.autovacuum_enabled"], "false");
    assert_eq!(orders.options["fillfactor"], "100");

    let customers = catalog.relation("public", "customers").unwrap();
    assert!(!customers.options.contains_key("autovacuum_vacuum_scale_factor"));

    let daily = catalog.relation("stats", "daily").unwrap();
    assert_eq!(daily.options["fillfactor"], "90");

    assert!(catalog.relation("archive", "events").unwrap().options.is_empty());

    let second = run(&provider, &config(), &options(2)).await.unwrap();
    assert_eq!(second.status, RunStatus::Complete);
    assert_eq!(second.stats.tables_applied, 0);
}

#[tokio::test]
async fn test_connections_bounded_by_tables() {
    let catalog = catalog();
    let provider = MemoryProvider::new(catalog.clone());

    run(&provider, &config(), &options(16)).await.unwrap();

    assert_eq!(provider.connections(), 3);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let catalog = catalog();
    let provider = MemoryProvider::new(catalog.clone());
    let before = catalog.relations();

    let report = run(
        &provider,
        &config(),
        &RunOptions {
            dry_run: true,
            ..options(2)
        },
    )
    .await
    .unwrap();

    assert_eq!(report.stats.tables_applied, 3);
    assert_eq!(catalog.relations(), before);
    assert!(catalog.statements().is_empty());
}

#[tokio::test]
async fn test_display_mode_opens_no_pool() {
    let catalog = catalog();
    let provider = MemoryProvider::new(catalog.clone());

    let report = run(
        &provider,
        &config(),
        &RunOptions {
            display_only: true,
            ..options(4)
        },
    )
    .await
    .unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(provider.connections(), 1);
    assert!(catalog.statements().is_empty());
}

#[tokio::test]
async fn test_lock_timeout_leaves_table_unmodified() {
    let catalog = catalog();
    catalog.contend("public", "orders", Contention::Forever);
    let provider = MemoryProvider::new(catalog.clone());

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        run(
            &provider,
            &config(),
            &RunOptions {
                lock_timeout: Some(Duration::from_millis(200)),
                ..options(2)
            },
        ),
    )
    .await
    .expect("run hung on a held lock")
    .unwrap();

    assert_eq!(report.status, RunStatus::LocksUnavailable);
    assert_eq!(report.stats.tables_locked, 1);
    assert_eq!(report.stats.tables_applied, 2);
    assert!(catalog.cancel_count() >= 1);
    assert_eq!(
        catalog.relation("public", "orders").unwrap().options["autovacuum_vacuum_scale_factor"],
        "0.2"
    );
}

#[tokio::test]
async fn test_every_table_gets_an_outcome() {
    let relations: Vec<_> = (0..40)
        .map(|i| table(i, "public", &format!("t{:03}", i), 10).with_option("fillfactor", "70"))
        .collect();
    let catalog = MemoryCatalog::new(relations);
    for i in (0..40).step_by(3) {
        catalog.contend("public", &format!("t{:03}", i), Contention::For(Duration::from_millis(5)));
    }
    for i in (1..40).step_by(7) {
        catalog.contend("public", &format!("t{:03}", i), Contention::Forever);
    }
    let provider = MemoryProvider::new(catalog.clone());

    let report = run(
        &provider,
        &config(),
        &RunOptions {
            lock_timeout: Some(Duration::from_millis(100)),
            ..options(6)
        },
    )
    .await
    .unwrap();

    let locked = (1..40).step_by(7).count();
    assert_eq!(report.stats.tables_matched, 40);
    assert_eq!(report.stats.tables_applied + report.stats.tables_unlocked(), 40);
    assert_eq!(report.stats.tables_locked, locked);
    assert_eq!(report.status, RunStatus::LocksUnavailable);
}

#[tokio::test]
async fn test_skip_locked_never_waits() {
    let catalog = catalog();
    catalog.contend("public", "orders", Contention::Forever);
    let provider = MemoryProvider::new(catalog.clone());

    let report = run(
        &provider,
        &config(),
        &RunOptions {
            skip_locked: true,
            ..options(1)
        },
    )
    .await
    .unwrap();

    assert_eq!(report.status, RunStatus::LocksUnavailable);
    assert_eq!(report.stats.tables_skipped, 1);
    assert_eq!(catalog.cancel_count(), 0);
}

#[tokio::test]
async fn test_parameter_failure_does_not_fail_table() {
    let catalog = catalog();
    catalog.reject_parameter("toast.autovacuum_enabled");
    let provider = MemoryProvider::new(catalog.clone());

    let report = run(&provider, &config(), &options(1)).await.unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.stats.parameters_failed, 1);
    let orders = catalog.relation("public", "orders").unwrap();
    assert_eq!(orders.options["autovacuum_vacuum_scale_factor"], "0.01");
    assert!(!orders.options.contains_key("toast.autovacuum_enabled"));
}

#[tokio::test]
async fn test_forbidden_table_is_fatal() {
    let catalog = catalog();
    catalog.forbid("public", "orders");
    let provider = MemoryProvider::new(catalog.clone());

    let err = run(&provider, &config(), &options(1)).await.unwrap_err();

    assert!(matches!(err, VacmanError::Statement { ref relation, .. } if relation.as_str() == "\"public\".\"orders\""));
}

#[tokio::test]
async fn test_password_rejection_is_distinguished() {
    let provider = MemoryProvider::rejecting_password(catalog());

    let err = run(&provider, &config(), &options(1)).await.unwrap_err();

    assert!(matches!(err, VacmanError::PasswordAuthentication(_)));
}
