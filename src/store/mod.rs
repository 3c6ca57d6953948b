//! Persistence seam
//!
//! [`StoreOps`] is the row-level surface the ledger, gate-pass, pickup and sweep logic
//! needs from the backing store. [`Store`] hands out a `StoreOps` either for a single
//! unit of work ([`Store::with_ops`]) or inside a transaction ([`Store::atomically`]),
//! where an `Err` from the closure discards every write the closure made.
//!
//! Two guarded writes carry the concurrency story:
//!
//! - [`StoreOps::decrement_allocation`] is one conditional update: it only succeeds
//!   when the row still holds at least `amount`, and reports failure as `None`;
//! - [`StoreOps::update_gate_pass`] only writes when the stored status still equals
//!   the status the caller loaded, so approval, pickup and sweep never overwrite each
//!   other's transitions.

use crate::consignment::{Category, Consignment};
use crate::error::CoreError;
use crate::executor::DbError;
use crate::gate_pass::{GatePass, GatePassFilter, GatePassStatus};
use crate::ledger::{Placement, StorageAllocation};
use crate::pickup::PickupRecord;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "mock"))]
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub trait StoreOps {
    fn insert_allocation(&self, placement: &Placement, now: DateTime<Utc>)
        -> Result<StorageAllocation, DbError>;

    fn allocation(&self, id: i64) -> Result<Option<StorageAllocation>, DbError>;

    fn allocations_for(&self, consignment_code: &str) -> Result<Vec<StorageAllocation>, DbError>;

    fn allocations_at(&self, room: &str, floor: &str) -> Result<Vec<StorageAllocation>, DbError>;

    /// Sum of `quantity` over the consignment's rows; `None` when it has no rows.
    fn total_quantity(&self, consignment_code: &str) -> Result<Option<i64>, DbError>;

    /// Take `amount` units from one row at (consignment, room, floor) holding at least
    /// `amount`, preferring rows whose gatar list contains `slot`.
    ///
    /// Returns the row as it is after the decrement, or `None` when no row satisfied the
    /// guard. Never drives a quantity negative.
    fn decrement_allocation(
        &self,
        consignment_code: &str,
        room: &str,
        floor: &str,
        slot: Option<&str>,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<StorageAllocation>, DbError>;

    fn set_breakdown(&self, id: i64, breakdown: Option<&[i64]>) -> Result<(), DbError>;

    /// Full field replace; `false` when the row does not exist.
    fn replace_allocation(
        &self,
        id: i64,
        placement: &Placement,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    fn delete_allocation(&self, id: i64) -> Result<bool, DbError>;

    fn count_consignments(&self, category: Category) -> Result<i64, DbError>;

    fn insert_consignment(&self, consignment: &Consignment) -> Result<(), DbError>;

    fn consignment(&self, code: &str) -> Result<Option<Consignment>, DbError>;

    fn set_consignment_customer(&self, code: &str, customer_ref: Option<&str>)
        -> Result<bool, DbError>;

    fn insert_gate_pass(&self, pass: &GatePass) -> Result<(), DbError>;

    fn gate_pass(&self, id: Uuid) -> Result<Option<GatePass>, DbError>;

    /// Load a gate pass and hold it against concurrent writers until the surrounding
    /// transaction ends.
    fn gate_pass_for_update(&self, id: Uuid) -> Result<Option<GatePass>, DbError>;

    fn list_gate_passes(&self, filter: &GatePassFilter) -> Result<Vec<GatePass>, DbError>;

    /// Persist every mutable field of `pass` if the stored status is still `expected`.
    fn update_gate_pass(&self, pass: &GatePass, expected: GatePassStatus)
        -> Result<bool, DbError>;

    /// Flip pending passes past `expires_at` and approved passes past
    /// `approval_expires_at` to expired; returns the ids that changed.
    fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, DbError>;

    fn insert_pickup(&self, pickup: &PickupRecord) -> Result<(), DbError>;

    fn pickups_for(&self, gate_pass_id: Uuid) -> Result<Vec<PickupRecord>, DbError>;

    /// Sum of pickup quantities recorded against a gate pass.
    fn picked_total(&self, gate_pass_id: Uuid) -> Result<i64, DbError>;
}

pub trait Store: Send + Sync {
    /// Run `f` against the store without a surrounding transaction.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or a storage failure acquiring a connection.
    fn with_ops<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn StoreOps) -> Result<T, CoreError>;

    /// Run `f` in a transaction, committing on `Ok` and discarding on `Err`.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or the storage failure that prevented the commit.
    fn atomically<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn StoreOps) -> Result<T, CoreError>;
}
