//! # Coldstore
//!
//! Withdrawal authorization for a cold-storage warehouse, on PostgreSQL and the `may`
//! coroutine runtime.
//!
//! - [`gatar`] splits a stored quantity across gatar slots;
//! - [`ledger::StorageLedger`] keeps per-location stock and only ever decrements it
//!   through a guarded conditional update;
//! - [`gate_pass::GatePassService`] runs the request/approval state machine;
//! - [`pickup::PickupRecorder`] records partial and full withdrawals transactionally;
//! - [`sweeper::ExpirySweeper`] expires passes whose deadlines have passed.
//!
//! The services are generic over [`store::Store`]: [`store::PgStore`] in production,
//! [`store::MemoryStore`] in tests (or with the `mock` feature).
//!
//! ```rust,no_run
//! use coldstore::config::ColdstoreConfig;
//! use coldstore::Coldstore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ColdstoreConfig::load()?;
//! let coldstore = Coldstore::connect(&config)?;
//! let pass = coldstore.gate_passes.create("7/500", 300, "customer-17")?;
//! coldstore.gate_passes.approve(pass.id, "manager-2", 300, "G1")?;
//! coldstore.pickups.record_pickup(pass.id, 100, "R1", "F2", Some("10"), "porter-4")?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod connection;
pub mod consignment;
pub mod error;
pub mod executor;
pub mod gatar;
pub mod gate_pass;
pub mod ledger;
pub mod metrics;
pub mod migration;
pub mod pickup;
pub mod pool;
pub mod store;
pub mod sweeper;
pub mod transaction;

pub use connection::{connect, ConnectionError};
pub use error::CoreError;
pub use executor::{DbError, PgExecutor, StoreExecutor};
pub use transaction::{IsolationLevel, Transaction, TransactionError};

use audit::{AuditSink, PgAuditLog};
use clock::{Clock, SystemClock};
use config::ColdstoreConfig;
use consignment::ConsignmentRegistry;
use gate_pass::GatePassService;
use ledger::StorageLedger;
use migration::{MigrationError, Migrator};
use pickup::PickupRecorder;
use pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;
use store::{PgStore, Store};
use sweeper::{ExpirySweeper, SweeperHandle};

/// Every service wired to one store, clock and audit sink.
pub struct Coldstore<S> {
    pub consignments: ConsignmentRegistry<S>,
    pub ledger: StorageLedger<S>,
    pub gate_passes: GatePassService<S>,
    pub pickups: PickupRecorder<S>,
    pub sweeper: ExpirySweeper<S>,
    sweep_interval: Duration,
}

impl<S: Store> Coldstore<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: &ColdstoreConfig,
    ) -> Self {
        let capacity = config.ledger.slot_capacity;
        Self {
            consignments: ConsignmentRegistry::new(store.clone(), clock.clone(), audit.clone()),
            ledger: StorageLedger::new(store.clone(), clock.clone(), audit.clone(), capacity),
            gate_passes: GatePassService::new(
                store.clone(),
                clock.clone(),
                audit.clone(),
                config.gate_pass.clone(),
            )
            .with_sweep_on_read(config.sweeper.sweep_on_read),
            pickups: PickupRecorder::new(store.clone(), clock.clone(), audit.clone(), capacity),
            sweeper: ExpirySweeper::new(store, clock, audit),
            sweep_interval: Duration::from_secs(config.sweeper.interval_seconds.max(1)),
        }
    }
}

impl<S: Store + 'static> Coldstore<S> {
    /// Start the periodic expiry sweep at the configured interval.
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.sweeper.spawn_periodic(self.sweep_interval)
    }
}

/// Errors raised while bringing the PostgreSQL deployment up.
#[derive(Debug)]
pub enum StartupError {
    Connection(ConnectionError),
    Migration(MigrationError),
    Storage(DbError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Connection(e) => write!(f, "connection failed: {e}"),
            StartupError::Migration(e) => write!(f, "migration failed: {e}"),
            StartupError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<ConnectionError> for StartupError {
    fn from(e: ConnectionError) -> Self {
        StartupError::Connection(e)
    }
}

impl From<MigrationError> for StartupError {
    fn from(e: MigrationError) -> Self {
        StartupError::Migration(e)
    }
}

impl From<DbError> for StartupError {
    fn from(e: DbError) -> Self {
        StartupError::Storage(e)
    }
}

impl Coldstore<PgStore> {
    /// Open the pool, apply pending migrations and wire the services with the system clock
    /// and the `admin_action_log` audit sink.
    ///
    /// # Errors
    ///
    /// Connection, migration or pool failures.
    pub fn connect(config: &ColdstoreConfig) -> Result<Self, StartupError> {
        let pool = Arc::new(ConnectionPool::open(&config.database)?);
        {
            let conn = pool.acquire()?;
            let applied = Migrator::new().up(&conn)?;
            if applied > 0 {
                log::info!("applied {applied} migration(s)");
            }
        }
        let store = Arc::new(PgStore::new(pool.clone()));
        Ok(Self::new(
            store,
            Arc::new(SystemClock),
            Arc::new(PgAuditLog::new(pool)),
            config,
        ))
    }
}
