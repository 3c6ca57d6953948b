//! In-memory [`Store`] for unit tests and the `mock` feature
//!
//! `atomically` runs the closure against a scratch copy of the state and swaps it in
//! only on success, which gives the same all-or-nothing outcome as a database
//! transaction. The whole store sits behind one mutex, so operations are serialized.

use super::{Store, StoreOps};
use crate::consignment::{Category, Consignment};
use crate::error::CoreError;
use crate::executor::DbError;
use crate::gate_pass::{GatePass, GatePassFilter, GatePassStatus};
use crate::ledger::{Placement, StorageAllocation};
use crate::pickup::PickupRecord;
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    allocations: BTreeMap<i64, StorageAllocation>,
    next_allocation_id: i64,
    consignments: BTreeMap<String, Consignment>,
    gate_passes: Vec<GatePass>,
    pickups: Vec<PickupRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_pickup_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `insert_pickup` fail, to exercise rollback of a pickup transaction.
    pub fn fail_pickup_inserts(&self, failing: bool) {
        self.fail_pickup_inserts.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Store for MemoryStore {
    fn with_ops<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn StoreOps) -> Result<T, CoreError>,
    {
        let mut guard = self.lock();
        let state = std::mem::take(&mut *guard);
        let ops = MemoryOps {
            state: RefCell::new(state),
            fail_pickup_inserts: self.fail_pickup_inserts.load(Ordering::SeqCst),
        };
        let result = f(&ops);
        *guard = ops.state.into_inner();
        result
    }

    fn atomically<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn StoreOps) -> Result<T, CoreError>,
    {
        let mut guard = self.lock();
        let ops = MemoryOps {
            state: RefCell::new(guard.clone()),
            fail_pickup_inserts: self.fail_pickup_inserts.load(Ordering::SeqCst),
        };
        let value = f(&ops)?;
        *guard = ops.state.into_inner();
        Ok(value)
    }
}

struct MemoryOps {
    state: RefCell<MemoryState>,
    fail_pickup_inserts: bool,
}

impl MemoryOps {
    fn state(&self) -> std::cell::Ref<'_, MemoryState> {
        self.state.borrow()
    }

    fn state_mut(&self) -> std::cell::RefMut<'_, MemoryState> {
        self.state.borrow_mut()
    }
}

fn contains_slot(row: &StorageAllocation, slot: Option<&str>) -> bool {
    slot.is_some_and(|slot| row.slots.iter().any(|s| s == slot))
}

impl StoreOps for MemoryOps {
    fn insert_allocation(
        &self,
        placement: &Placement,
        now: DateTime<Utc>,
    ) -> Result<StorageAllocation, DbError> {
        let mut state = self.state_mut();
        state.next_allocation_id += 1;
        let row = StorageAllocation {
            id: state.next_allocation_id,
            consignment_code: placement.consignment_code.clone(),
            room: placement.room.clone(),
            floor: placement.floor.clone(),
            slots: placement.slots.clone(),
            quantity: placement.quantity,
            breakdown: placement.breakdown.clone(),
            remark: placement.remark.clone(),
            created_at: now,
            updated_at: now,
        };
        state.allocations.insert(row.id, row.clone());
        Ok(row)
    }

    fn allocation(&self, id: i64) -> Result<Option<StorageAllocation>, DbError> {
        Ok(self.state().allocations.get(&id).cloned())
    }

    fn allocations_for(&self, consignment_code: &str) -> Result<Vec<StorageAllocation>, DbError> {
        Ok(self
            .state()
            .allocations
            .values()
            .filter(|row| row.consignment_code == consignment_code)
            .cloned()
            .collect())
    }

    fn allocations_at(&self, room: &str, floor: &str) -> Result<Vec<StorageAllocation>, DbError> {
        Ok(self
            .state()
            .allocations
            .values()
            .filter(|row| row.room == room && row.floor == floor)
            .cloned()
            .collect())
    }

    fn total_quantity(&self, consignment_code: &str) -> Result<Option<i64>, DbError> {
        let state = self.state();
        let mut rows = state
            .allocations
            .values()
            .filter(|row| row.consignment_code == consignment_code)
            .peekable();
        if rows.peek().is_none() {
            return Ok(None);
        }
        Ok(Some(rows.map(|row| row.quantity).sum()))
    }

    fn decrement_allocation(
        &self,
        consignment_code: &str,
        room: &str,
        floor: &str,
        slot: Option<&str>,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<StorageAllocation>, DbError> {
        let mut state = self.state_mut();
        let target = state
            .allocations
            .values()
            .filter(|row| {
                row.consignment_code == consignment_code
                    && row.room == room
                    && row.floor == floor
                    && row.quantity >= amount
            })
            .min_by_key(|row| (!contains_slot(row, slot), row.id))
            .map(|row| row.id);

        let Some(id) = target else {
            return Ok(None);
        };
        let Some(row) = state.allocations.get_mut(&id) else {
            return Ok(None);
        };
        row.quantity -= amount;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    fn set_breakdown(&self, id: i64, breakdown: Option<&[i64]>) -> Result<(), DbError> {
        if let Some(row) = self.state_mut().allocations.get_mut(&id) {
            row.breakdown = breakdown.map(<[i64]>::to_vec);
        }
        Ok(())
    }

    fn replace_allocation(
        &self,
        id: i64,
        placement: &Placement,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut state = self.state_mut();
        let Some(row) = state.allocations.get_mut(&id) else {
            return Ok(false);
        };
        row.consignment_code = placement.consignment_code.clone();
        row.room = placement.room.clone();
        row.floor = placement.floor.clone();
        row.slots = placement.slots.clone();
        row.quantity = placement.quantity;
        row.breakdown = placement.breakdown.clone();
        row.remark = placement.remark.clone();
        row.updated_at = now;
        Ok(true)
    }

    fn delete_allocation(&self, id: i64) -> Result<bool, DbError> {
        Ok(self.state_mut().allocations.remove(&id).is_some())
    }

    fn count_consignments(&self, category: Category) -> Result<i64, DbError> {
        let count = self
            .state()
            .consignments
            .values()
            .filter(|c| c.category == category)
            .count();
        i64::try_from(count).map_err(|e| DbError::Other(e.to_string()))
    }

    fn insert_consignment(&self, consignment: &Consignment) -> Result<(), DbError> {
        let mut state = self.state_mut();
        if state.consignments.contains_key(&consignment.code) {
            return Err(DbError::QueryError(format!(
                "duplicate consignment code {}",
                consignment.code
            )));
        }
        state
            .consignments
            .insert(consignment.code.clone(), consignment.clone());
        Ok(())
    }

    fn consignment(&self, code: &str) -> Result<Option<Consignment>, DbError> {
        Ok(self.state().consignments.get(code).cloned())
    }

    fn set_consignment_customer(
        &self,
        code: &str,
        customer_ref: Option<&str>,
    ) -> Result<bool, DbError> {
        let mut state = self.state_mut();
        let Some(consignment) = state.consignments.get_mut(code) else {
            return Ok(false);
        };
        consignment.customer_ref = customer_ref.map(str::to_string);
        Ok(true)
    }

    fn insert_gate_pass(&self, pass: &GatePass) -> Result<(), DbError> {
        let mut state = self.state_mut();
        if state.gate_passes.iter().any(|p| p.id == pass.id) {
            return Err(DbError::QueryError(format!("duplicate gate pass {}", pass.id)));
        }
        state.gate_passes.push(pass.clone());
        Ok(())
    }

    fn gate_pass(&self, id: Uuid) -> Result<Option<GatePass>, DbError> {
        Ok(self.state().gate_passes.iter().find(|p| p.id == id).cloned())
    }

    fn gate_pass_for_update(&self, id: Uuid) -> Result<Option<GatePass>, DbError> {
        self.gate_pass(id)
    }

    fn list_gate_passes(&self, filter: &GatePassFilter) -> Result<Vec<GatePass>, DbError> {
        let mut passes: Vec<GatePass> = self
            .state()
            .gate_passes
            .iter()
            .rev()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        passes.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(passes)
    }

    fn update_gate_pass(&self, pass: &GatePass, expected: GatePassStatus) -> Result<bool, DbError> {
        let mut state = self.state_mut();
        match state
            .gate_passes
            .iter_mut()
            .find(|p| p.id == pass.id && p.status == expected)
        {
            Some(stored) => {
                *stored = pass.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, DbError> {
        Ok(self
            .state_mut()
            .gate_passes
            .iter_mut()
            .filter_map(|p| p.expire(now).then_some(p.id))
            .collect())
    }

    fn insert_pickup(&self, pickup: &PickupRecord) -> Result<(), DbError> {
        if self.fail_pickup_inserts {
            return Err(DbError::Other("pickup insert failed".to_string()));
        }
        self.state_mut().pickups.push(pickup.clone());
        Ok(())
    }

    fn pickups_for(&self, gate_pass_id: Uuid) -> Result<Vec<PickupRecord>, DbError> {
        Ok(self
            .state()
            .pickups
            .iter()
            .filter(|p| p.gate_pass_id == gate_pass_id)
            .cloned()
            .collect())
    }

    fn picked_total(&self, gate_pass_id: Uuid) -> Result<i64, DbError> {
        Ok(self
            .state()
            .pickups
            .iter()
            .filter(|p| p.gate_pass_id == gate_pass_id)
            .map(|p| p.quantity)
            .sum())
    }
}
