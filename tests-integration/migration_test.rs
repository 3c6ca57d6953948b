//! Integration tests for the migration system
//!
//! Test flow:
//! 1. Start from a fresh, migrated schema
//! 2. Check the state table and the created tables
//! 3. Roll back and re-apply

#[path = "common.rs"]
mod common;

use coldstore::migration::Migrator;
use coldstore::StoreExecutor;
use common::TestDatabase;

const TABLES: [&str; 5] = [
    "consignments",
    "room_entries",
    "gate_passes",
    "gate_pass_pickups",
    "admin_action_log",
];

fn table_exists(executor: &dyn StoreExecutor, table: &str) -> bool {
    executor
        .query_opt(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1",
            &[&table],
        )
        .expect("query information_schema")
        .is_some()
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_builtin_migrations_apply_once() {
    let db = TestDatabase::start("it_migrations", 1);
    let conn = db.pool.acquire().expect("acquire");

    let status = Migrator::new().status(&*conn).expect("status");
    assert!(status.is_up_to_date());
    assert_eq!(status.applied.len(), TABLES.len());
    assert_eq!(status.latest_applied_version(), Some(20240301000005));
    for table in TABLES {
        assert!(table_exists(&*conn, table), "{table} missing");
    }

    assert_eq!(Migrator::new().up(&conn).expect("re-run"), 0);
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_down_then_up() {
    let db = TestDatabase::start("it_migrations_down", 1);
    let conn = db.pool.acquire().expect("acquire");
    let migrator = Migrator::new();

    assert_eq!(migrator.down(&conn, 2).expect("down"), 2);
    assert!(!table_exists(&*conn, "admin_action_log"));
    assert!(!table_exists(&*conn, "gate_pass_pickups"));
    assert!(table_exists(&*conn, "gate_passes"));

    let status = migrator.status(&*conn).expect("status");
    assert_eq!(status.pending.len(), 2);
    assert_eq!(status.latest_applied_version(), Some(20240301000003));

    assert_eq!(migrator.up(&conn).expect("up"), 2);
    assert!(table_exists(&*conn, "admin_action_log"));
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_constraints_reject_negative_stock() {
    let db = TestDatabase::start("it_constraints", 1);
    let conn = db.pool.acquire().expect("acquire");
    let result = conn.execute(
        "INSERT INTO room_entries (consignment_code, room, floor, slots, quantity, created_at, updated_at) \
         VALUES ('1/10', 'R1', 'F1', '1', -1, now(), now())",
        &[],
    );
    assert!(result.is_err());
}
