//! End-to-end withdrawal flows against a real PostgreSQL database
//!
//! Run with `cargo test -p coldstore-integration-tests -- --ignored`; needs Docker, or a
//! server reachable through `TEST_DATABASE_URL`.

#[path = "common.rs"]
mod common;

use chrono::{Duration, TimeZone, Utc};
use coldstore::audit::{AuditSink, LogAudit, PgAuditLog};
use coldstore::clock::{Clock, FixedClock, SystemClock};
use coldstore::config::ColdstoreConfig;
use coldstore::consignment::Category;
use coldstore::gate_pass::{GatePassFilter, GatePassStatus};
use coldstore::ledger::Placement;
use coldstore::store::PgStore;
use coldstore::{Coldstore, CoreError, StoreExecutor};
use common::TestDatabase;
use rust_decimal::Decimal;
use std::sync::Arc;

fn coldstore(db: &TestDatabase, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Coldstore<PgStore> {
    Coldstore::new(
        Arc::new(PgStore::new(db.pool.clone())),
        clock,
        audit,
        &ColdstoreConfig::default(),
    )
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_partial_then_full_withdrawal() {
    let db = TestDatabase::start("it_withdrawal", 4);
    let cs = coldstore(&db, Arc::new(SystemClock), Arc::new(PgAuditLog::new(db.pool.clone())));

    let consignment = cs
        .consignments
        .register(Category::Seed, 500, Some("customer-17"), "clerk")
        .expect("register");
    assert_eq!(consignment.code, "1/500");
    cs.ledger
        .record_placement(
            &Placement::new(&consignment.code, "R1", "F2", &["10", "11", "12"], 500)
                .with_breakdown(vec![200, 200, 100]),
            "clerk",
        )
        .expect("place");

    let pass = cs
        .gate_passes
        .create(&consignment.code, 300, "customer-17")
        .expect("create");
    cs.gate_passes
        .verify_payment(pass.id, Decimal::new(4_500, 0), "cashier")
        .expect("payment");
    cs.gate_passes
        .approve(pass.id, "manager", 300, "G1")
        .expect("approve");

    let after = cs
        .pickups
        .record_pickup(pass.id, 100, "R1", "F2", Some("11"), "porter")
        .expect("first pickup");
    assert_eq!(after.status, GatePassStatus::PartiallyCompleted);
    assert_eq!(cs.ledger.total_quantity(&consignment.code).unwrap(), 400);

    let after = cs
        .pickups
        .record_pickup(pass.id, 200, "R1", "F2", None, "porter")
        .expect("second pickup");
    assert_eq!(after.status, GatePassStatus::Completed);
    assert_eq!(after.total_picked_up, 300);
    assert!(after.completed_at.is_some());
    assert_eq!(cs.ledger.total_quantity(&consignment.code).unwrap(), 200);

    let stored = cs.gate_passes.get(pass.id).expect("get");
    assert_eq!(stored.payment_amount, Some(Decimal::new(4_500, 0)));
    assert_eq!(cs.pickups.pickups_for(pass.id).unwrap().len(), 2);

    let conn = db.pool.acquire().expect("acquire");
    let row = conn
        .query_one("SELECT COUNT(*) FROM admin_action_log", &[])
        .expect("count audit rows");
    let audited: i64 = row.get(0);
    assert_eq!(audited, 7);
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_competing_pickups_never_oversell() {
    let db = TestDatabase::start("it_competing", 10);
    let cs = Arc::new(coldstore(&db, Arc::new(SystemClock), Arc::new(LogAudit)));

    cs.ledger
        .record_placement(&Placement::new("7/100", "R1", "F1", &["10"], 100), "clerk")
        .expect("place");
    let passes: Vec<_> = (0..8)
        .map(|i| {
            let pass = cs
                .gate_passes
                .create("7/100", 100, &format!("customer-{i}"))
                .expect("create");
            cs.gate_passes
                .approve(pass.id, "manager", 100, "G1")
                .expect("approve")
        })
        .collect();

    let handles: Vec<_> = passes
        .iter()
        .map(|pass| {
            let cs = cs.clone();
            let id = pass.id;
            may::go!(move || cs.pickups.record_pickup(id, 100, "R1", "F1", None, "porter"))
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("coroutine panicked"))
        .collect();

    let won = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1, "{outcomes:?}");
    assert!(outcomes
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(CoreError::is_conflict));
    assert_eq!(cs.ledger.total_quantity("7/100").unwrap(), 0);

    let completed = cs
        .gate_passes
        .list(&GatePassFilter::for_consignment("7/100").with_status(GatePassStatus::Completed))
        .expect("list");
    assert_eq!(completed.len(), 1);
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_concurrent_decrements_are_guarded() {
    let db = TestDatabase::start("it_decrements", 10);
    let cs = Arc::new(coldstore(&db, Arc::new(SystemClock), Arc::new(LogAudit)));
    cs.ledger
        .record_placement(&Placement::new("8/50", "R3", "F1", &["1", "2"], 50), "clerk")
        .expect("place");

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let cs = cs.clone();
            may::go!(move || cs.ledger.decrement("8/50", "R3", "F1", 10, "clerk"))
        })
        .collect();
    let successes = handles
        .into_iter()
        .map(|h| h.join().expect("coroutine panicked").expect("decrement"))
        .filter(|ok| *ok)
        .count();

    assert_eq!(successes, 5);
    assert_eq!(cs.ledger.total_quantity("8/50").unwrap(), 0);
    assert_eq!(db.pool.idle(), db.pool.size());
}

#[test]
#[ignore = "needs PostgreSQL"]
fn test_sweep_expires_lapsed_passes() {
    let db = TestDatabase::start("it_sweep", 2);
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
    ));
    let cs = coldstore(&db, clock.clone(), Arc::new(LogAudit));
    cs.ledger
        .record_placement(&Placement::new("7/500", "R1", "F1", &["10"], 500), "clerk")
        .expect("place");

    let pending = cs.gate_passes.create("7/500", 100, "customer-1").unwrap();
    let approved = cs.gate_passes.create("7/500", 100, "customer-2").unwrap();
    cs.gate_passes.approve(approved.id, "manager", 100, "G1").unwrap();

    clock.advance(Duration::hours(16));
    assert_eq!(cs.sweeper.sweep_now().unwrap(), 1);
    assert!(matches!(
        cs.pickups.record_pickup(approved.id, 10, "R1", "F1", None, "porter"),
        Err(CoreError::Conflict(_))
    ));

    clock.advance(Duration::hours(15));
    assert_eq!(cs.sweeper.sweep_now().unwrap(), 1);
    assert_eq!(cs.sweeper.sweep_now().unwrap(), 0);
    assert_eq!(
        cs.gate_passes.get(pending.id).unwrap().status,
        GatePassStatus::Expired
    );
    assert_eq!(cs.ledger.total_quantity("7/500").unwrap(), 500);
}
