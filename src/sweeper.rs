//! Expiry of lapsed gate passes
//!
//! A sweep flips pending passes past their approval deadline and approved passes past
//! their pickup deadline to `expired`, in one conditional statement. Partially completed
//! passes are left alone. Sweeps are idempotent, so the periodic coroutine, the lazy
//! sweep in [`GatePassService::list`](crate::gate_pass::GatePassService::list) and
//! manual calls can overlap freely.

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Actor recorded on audit entries written by the sweeper.
pub const SWEEPER_ACTOR: &str = "system:expiry-sweeper";

/// Floor for the periodic sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub struct ExpirySweeper<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl<S> Clone for ExpirySweeper<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S: Store> ExpirySweeper<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, clock, audit }
    }

    /// Expire everything stale as of `now`; returns how many passes changed.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::sweep_span().entered();

        let expired = self.store.with_ops(|ops| Ok(ops.expire_stale(now)?))?;
        if expired.is_empty() {
            return Ok(0);
        }

        #[cfg(feature = "metrics")]
        METRICS.record_expired(expired.len());
        log::info!("expired {} gate pass(es)", expired.len());
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                SWEEPER_ACTOR,
                AuditAction::GatePassesExpired,
                format!("expired {} lapsed gate pass(es)", expired.len()),
                now,
            )
            .with_details(json!({ "gate_pass_ids": expired })),
        );
        Ok(expired.len())
    }

    /// [`sweep`](Self::sweep) at the clock's current time.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn sweep_now(&self) -> Result<usize, CoreError> {
        self.sweep(self.clock.now())
    }
}

impl<S: Store + 'static> ExpirySweeper<S> {
    /// Sweep every `interval` on a may coroutine until the handle is stopped. Intervals
    /// shorter than [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn spawn_periodic(&self, interval: Duration) -> SweeperHandle {
        let (interval, tick) = pacing(interval);
        let stop = Arc::new(AtomicBool::new(false));
        let sweeper = self.clone();
        let flag = stop.clone();

        let join = may::go!(move || {
            log::debug!("expiry sweeper started, interval {interval:?}");
            while !flag.load(Ordering::Acquire) {
                if let Err(e) = sweeper.sweep_now() {
                    log::warn!("expiry sweep failed: {e}");
                }
                let mut waited = Duration::ZERO;
                while waited < interval && !flag.load(Ordering::Acquire) {
                    may::coroutine::sleep(tick);
                    waited += tick;
                }
            }
            log::debug!("expiry sweeper stopped");
        });
        SweeperHandle {
            stop,
            join: Some(join),
        }
    }
}

/// Effective interval and the sleep slice used to notice a stop request.
fn pacing(interval: Duration) -> (Duration, Duration) {
    let interval = interval.max(MIN_SWEEP_INTERVAL);
    (interval, Duration::from_millis(50).min(interval))
}

/// Stops the periodic sweep when told to or when dropped.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    join: Option<may::coroutine::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("expiry sweeper coroutine panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::clock::FixedClock;
    use crate::config::GatePassConfig;
    use crate::gate_pass::{GatePassFilter, GatePassService, GatePassStatus};
    use crate::ledger::{Placement, StorageLedger};
    use crate::pickup::PickupRecorder;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<FixedClock>,
        audit: Arc<MemoryAudit>,
        passes: GatePassService<MemoryStore>,
        pickups: PickupRecorder<MemoryStore>,
        sweeper: ExpirySweeper<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        ));
        let audit = Arc::new(MemoryAudit::new());
        StorageLedger::new(store.clone(), clock.clone(), audit.clone(), 200)
            .record_placement(&Placement::new("7/500", "R1", "F1", &["10"], 500), "clerk")
            .unwrap();
        Fixture {
            passes: GatePassService::new(
                store.clone(),
                clock.clone(),
                audit.clone(),
                GatePassConfig::default(),
            )
            .with_sweep_on_read(false),
            pickups: PickupRecorder::new(store.clone(), clock.clone(), audit.clone(), 200),
            sweeper: ExpirySweeper::new(store, clock.clone(), audit.clone()),
            clock,
            audit,
        }
    }

    #[test]
    fn test_sweep_expires_only_lapsed_passes() {
        let f = fixture();
        let pending = f.passes.create("7/500", 100, "customer-1").unwrap();
        let approved = f.passes.create("7/500", 100, "customer-2").unwrap();
        let approved = f.passes.approve(approved.id, "manager", 100, "G1").unwrap();
        let partial = f.passes.create("7/500", 100, "customer-3").unwrap();
        f.passes.approve(partial.id, "manager", 100, "G1").unwrap();
        f.pickups
            .record_pickup(partial.id, 40, "R1", "F1", None, "porter")
            .unwrap();

        f.clock.advance(chrono::Duration::hours(14));
        assert_eq!(f.sweeper.sweep_now().unwrap(), 0);

        // approval windows close at 15h, issuance windows at 30h
        f.clock.advance(chrono::Duration::hours(2));
        assert_eq!(f.sweeper.sweep_now().unwrap(), 1);
        assert_eq!(f.passes.get(approved.id).unwrap().status, GatePassStatus::Expired);
        assert_eq!(f.passes.get(pending.id).unwrap().status, GatePassStatus::Pending);

        f.clock.advance(chrono::Duration::hours(15));
        assert_eq!(f.sweeper.sweep_now().unwrap(), 1);
        assert_eq!(f.passes.get(pending.id).unwrap().status, GatePassStatus::Expired);
        assert_eq!(
            f.passes.get(partial.id).unwrap().status,
            GatePassStatus::PartiallyCompleted
        );
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let f = fixture();
        f.passes.create("7/500", 100, "customer-1").unwrap();
        f.clock.advance(chrono::Duration::hours(31));

        assert_eq!(f.sweeper.sweep_now().unwrap(), 1);
        assert_eq!(f.sweeper.sweep_now().unwrap(), 0);
        let expired = f
            .passes
            .list(&GatePassFilter::default().with_status(GatePassStatus::Expired))
            .unwrap();
        assert_eq!(expired.len(), 1);
        let sweeps = f
            .audit
            .actions()
            .into_iter()
            .filter(|a| *a == AuditAction::GatePassesExpired)
            .count();
        assert_eq!(sweeps, 1);
    }

    #[test]
    fn test_expired_pass_cannot_be_approved() {
        let f = fixture();
        let pass = f.passes.create("7/500", 100, "customer-1").unwrap();
        f.clock
            .advance(chrono::Duration::hours(30) + chrono::Duration::seconds(1));
        assert_eq!(f.sweeper.sweep_now().unwrap(), 1);
        assert_eq!(f.passes.get(pass.id).unwrap().status, GatePassStatus::Expired);

        assert!(matches!(
            f.passes.approve(pass.id, "manager", 100, "G1"),
            Err(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_periodic_sweep_runs_until_stopped() {
        let f = fixture();
        let pass = f.passes.create("7/500", 100, "customer-1").unwrap();
        f.clock.advance(chrono::Duration::hours(31));

        let handle = f.sweeper.spawn_periodic(Duration::from_millis(10));
        let mut expired = false;
        for _ in 0..200 {
            if f.passes.get(pass.id).unwrap().status == GatePassStatus::Expired {
                expired = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();
        assert!(expired);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let (interval, tick) = pacing(Duration::ZERO);
        assert_eq!(interval, MIN_SWEEP_INTERVAL);
        assert!(tick > Duration::ZERO);
        assert_eq!(
            pacing(Duration::from_secs(300)),
            (Duration::from_secs(300), Duration::from_millis(50))
        );

        let f = fixture();
        f.passes.create("7/500", 100, "customer-1").unwrap();
        f.clock.advance(chrono::Duration::hours(31));
        let handle = f.sweeper.spawn_periodic(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        assert_eq!(
            f.audit
                .actions()
                .into_iter()
                .filter(|a| *a == AuditAction::GatePassesExpired)
                .count(),
            1
        );
    }
}
