//! Storage ledger
//!
//! One [`StorageAllocation`] row per placement of (part of) a consignment into a
//! room/floor/gatar set. Quantities only ever leave through [`apply_decrement`], which
//! rides on the store's guarded conditional update, so a row can never go negative and
//! an insufficient-stock decrement changes nothing.

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::gatar;
use crate::store::{Store, StoreOps};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAllocation {
    pub id: i64,
    pub consignment_code: String,
    pub room: String,
    pub floor: String,
    pub slots: Vec<String>,
    pub quantity: i64,
    pub breakdown: Option<Vec<i64>>,
    pub remark: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageAllocation {
    /// Units per gatar, in gatar order.
    pub fn per_slot(&self, capacity: i64) -> Vec<(String, i64)> {
        let quantities = gatar::distribute_with_capacity(
            self.quantity,
            &self.slots,
            self.breakdown.as_deref(),
            capacity,
        );
        self.slots.iter().cloned().zip(quantities).collect()
    }
}

/// Fields of a new or replacement allocation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub consignment_code: String,
    pub room: String,
    pub floor: String,
    pub slots: Vec<String>,
    pub quantity: i64,
    #[serde(default)]
    pub breakdown: Option<Vec<i64>>,
    #[serde(default)]
    pub remark: String,
}

impl Placement {
    pub fn new(
        consignment_code: impl Into<String>,
        room: impl Into<String>,
        floor: impl Into<String>,
        slots: &[&str],
        quantity: i64,
    ) -> Self {
        Self {
            consignment_code: consignment_code.into(),
            room: room.into(),
            floor: floor.into(),
            slots: slots.iter().map(|s| s.to_string()).collect(),
            quantity,
            breakdown: None,
            remark: String::new(),
        }
    }

    pub fn with_breakdown(mut self, breakdown: Vec<i64>) -> Self {
        self.breakdown = Some(breakdown);
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    /// # Errors
    ///
    /// `Validation` naming the first bad field.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in [
            ("consignment code", &self.consignment_code),
            ("room", &self.room),
            ("floor", &self.floor),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::validation(format!("{name} is required")));
            }
        }
        if self.quantity <= 0 {
            return Err(CoreError::validation("quantity must be positive"));
        }
        gatar::validate_slots(&self.slots).map_err(CoreError::Validation)?;

        if let Some(breakdown) = &self.breakdown {
            if breakdown.iter().any(|&v| v < 0) {
                return Err(CoreError::validation("breakdown entries cannot be negative"));
            }
            let sum = gatar::checked_total(breakdown)
                .ok_or_else(|| CoreError::validation("breakdown total overflows"))?;
            if sum != self.quantity {
                return Err(CoreError::validation(format!(
                    "breakdown sums to {sum} but quantity is {}",
                    self.quantity
                )));
            }
        }
        Ok(())
    }
}

/// One gatar's share of an allocation, for occupancy rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOccupancy {
    pub slot: String,
    pub consignment_code: String,
    pub allocation_id: i64,
    pub quantity: i64,
}

/// Guarded decrement plus breakdown upkeep, for use inside a store transaction.
///
/// Returns the updated row, or `None` when no row at the location held `amount` units;
/// in that case nothing was written.
///
/// # Errors
///
/// Storage failures only; insufficient stock is `Ok(None)`.
#[allow(clippy::too_many_arguments)]
pub fn apply_decrement(
    ops: &dyn StoreOps,
    consignment_code: &str,
    room: &str,
    floor: &str,
    slot: Option<&str>,
    amount: i64,
    capacity: i64,
    now: DateTime<Utc>,
) -> Result<Option<StorageAllocation>, CoreError> {
    let Some(mut row) =
        ops.decrement_allocation(consignment_code, room, floor, slot, amount, now)?
    else {
        return Ok(None);
    };

    if let Some(breakdown) = row.breakdown.take() {
        let before = row.quantity + amount;
        let rebalanced = gatar::withdraw_from_slot(
            before,
            &row.slots,
            Some(&breakdown),
            slot.unwrap_or_default(),
            amount,
            capacity,
        );
        if rebalanced.is_none() {
            log::warn!(
                "allocation {} breakdown {:?} does not reconcile with quantity {before}; dropping it",
                row.id,
                breakdown
            );
        }
        ops.set_breakdown(row.id, rebalanced.as_deref())?;
        row.breakdown = rebalanced;
    }
    Ok(Some(row))
}

pub struct StorageLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    slot_capacity: i64,
}

impl<S: Store> StorageLedger<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        slot_capacity: i64,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            slot_capacity,
        }
    }

    pub fn slot_capacity(&self) -> i64 {
        self.slot_capacity
    }

    /// Insert an allocation row. Repeated placements at one location are separate rows.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed placement.
    pub fn record_placement(
        &self,
        placement: &Placement,
        actor: &str,
    ) -> Result<StorageAllocation, CoreError> {
        placement.validate()?;
        let now = self.clock.now();
        let row = self
            .store
            .with_ops(|ops| Ok(ops.insert_allocation(placement, now)?))?;

        log::info!(
            "placed {} of {} in room {} floor {} gatars {}",
            row.quantity,
            row.consignment_code,
            row.room,
            row.floor,
            gatar::format_slots(&row.slots)
        );
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::PlacementRecorded,
                format!(
                    "placed {} of {} in room {} floor {}",
                    row.quantity, row.consignment_code, row.room, row.floor
                ),
                now,
            )
            .with_details(json!({ "allocation_id": row.id, "slots": row.slots })),
        );
        Ok(row)
    }

    /// Units on record for a consignment across all of its rows; 0 when it has none.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub fn total_quantity(&self, consignment_code: &str) -> Result<i64, CoreError> {
        Ok(self
            .store
            .with_ops(|ops| Ok(ops.total_quantity(consignment_code)?))?
            .unwrap_or(0))
    }

    /// Conditionally take `amount` units out of (consignment, room, floor).
    ///
    /// Returns `false` when no row there holds `amount`; the ledger is unchanged.
    ///
    /// # Errors
    ///
    /// `Validation` for a non-positive amount; storage failures.
    pub fn decrement(
        &self,
        consignment_code: &str,
        room: &str,
        floor: &str,
        amount: i64,
        actor: &str,
    ) -> Result<bool, CoreError> {
        if amount <= 0 {
            return Err(CoreError::validation("amount must be positive"));
        }
        let now = self.clock.now();
        let capacity = self.slot_capacity;
        let row = self.store.atomically(|ops| {
            apply_decrement(ops, consignment_code, room, floor, None, amount, capacity, now)
        })?;

        if let Some(row) = &row {
            audit::emit(
                self.audit.as_ref(),
                AuditEntry::new(
                    actor,
                    AuditAction::AllocationDecremented,
                    format!(
                        "removed {amount} of {consignment_code} from room {room} floor {floor}"
                    ),
                    now,
                )
                .with_details(json!({ "allocation_id": row.id, "remaining": row.quantity })),
            );
        }
        Ok(row.is_some())
    }

    /// # Errors
    ///
    /// Storage failures only.
    pub fn allocations_for(
        &self,
        consignment_code: &str,
    ) -> Result<Vec<StorageAllocation>, CoreError> {
        self.store
            .with_ops(|ops| Ok(ops.allocations_for(consignment_code)?))
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn allocation(&self, id: i64) -> Result<StorageAllocation, CoreError> {
        self.store
            .with_ops(|ops| Ok(ops.allocation(id)?))?
            .ok_or_else(|| CoreError::not_found(format!("allocation {id}")))
    }

    /// Per-gatar occupancy of every allocation in a room/floor.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub fn occupancy(&self, room: &str, floor: &str) -> Result<Vec<SlotOccupancy>, CoreError> {
        let rows = self.store.with_ops(|ops| Ok(ops.allocations_at(room, floor)?))?;
        Ok(rows
            .iter()
            .flat_map(|row| {
                row.per_slot(self.slot_capacity)
                    .into_iter()
                    .map(move |(slot, quantity)| SlotOccupancy {
                        slot,
                        consignment_code: row.consignment_code.clone(),
                        allocation_id: row.id,
                        quantity,
                    })
            })
            .collect())
    }

    /// Replace every field of an allocation row (manual correction).
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed replacement, `NotFound` for an unknown id.
    pub fn edit_allocation(
        &self,
        id: i64,
        replacement: &Placement,
        actor: &str,
    ) -> Result<StorageAllocation, CoreError> {
        replacement.validate()?;
        let now = self.clock.now();
        let (before, after) = self.store.atomically(|ops| {
            let before = ops
                .allocation(id)?
                .ok_or_else(|| CoreError::not_found(format!("allocation {id}")))?;
            if !ops.replace_allocation(id, replacement, now)? {
                return Err(CoreError::not_found(format!("allocation {id}")));
            }
            let after = ops
                .allocation(id)?
                .ok_or_else(|| CoreError::not_found(format!("allocation {id}")))?;
            Ok((before, after))
        })?;

        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::AllocationEdited,
                format!(
                    "edited allocation {id} of {}: quantity {} -> {}",
                    after.consignment_code, before.quantity, after.quantity
                ),
                now,
            )
            .with_details(json!({ "before": before, "after": after })),
        );
        Ok(after)
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn delete_allocation(&self, id: i64, actor: &str) -> Result<(), CoreError> {
        let now = self.clock.now();
        let removed = self.store.atomically(|ops| {
            let row = ops
                .allocation(id)?
                .ok_or_else(|| CoreError::not_found(format!("allocation {id}")))?;
            ops.delete_allocation(id)?;
            Ok(row)
        })?;

        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::AllocationDeleted,
                format!(
                    "deleted allocation {id} ({} of {} in room {} floor {})",
                    removed.quantity, removed.consignment_code, removed.room, removed.floor
                ),
                now,
            )
            .with_details(json!({ "allocation": removed })),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn ledger() -> (StorageLedger<MemoryStore>, Arc<MemoryAudit>) {
        let audit = Arc::new(MemoryAudit::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()));
        let ledger = StorageLedger::new(
            Arc::new(MemoryStore::new()),
            clock,
            audit.clone(),
            gatar::DEFAULT_SLOT_CAPACITY,
        );
        (ledger, audit)
    }

    #[test]
    fn test_placements_at_same_location_are_summed() {
        let (ledger, _) = ledger();
        ledger
            .record_placement(&Placement::new("7/500", "R1", "F2", &["10"], 200), "clerk")
            .unwrap();
        ledger
            .record_placement(&Placement::new("7/500", "R1", "F2", &["10"], 300), "clerk")
            .unwrap();
        ledger
            .record_placement(&Placement::new("8/40", "R1", "F2", &["11"], 40), "clerk")
            .unwrap();

        assert_eq!(ledger.total_quantity("7/500").unwrap(), 500);
        assert_eq!(ledger.allocations_for("7/500").unwrap().len(), 2);
        assert_eq!(ledger.total_quantity("unknown").unwrap(), 0);
    }

    #[test]
    fn test_placement_validation() {
        let (ledger, _) = ledger();
        let cases = [
            Placement::new("7/500", "R1", "F2", &["10"], 0),
            Placement::new("", "R1", "F2", &["10"], 10),
            Placement::new("7/500", "R1", "F2", &[], 10),
            Placement::new("7/500", "R1", "F2", &["10", "11"], 10).with_breakdown(vec![5, 4]),
            Placement::new("7/500", "R1", "F2", &["10", "11"], 10).with_breakdown(vec![11, -1]),
            // wraps to 1 in two's complement
            Placement::new("7/500", "R1", "F2", &["10", "11", "12"], 1)
                .with_breakdown(vec![i64::MAX, i64::MAX, 3]),
        ];
        for placement in cases {
            assert!(
                matches!(
                    ledger.record_placement(&placement, "clerk"),
                    Err(CoreError::Validation(_))
                ),
                "{placement:?}"
            );
        }
        assert_eq!(ledger.total_quantity("7/500").unwrap(), 0);
    }

    #[test]
    fn test_decrement_is_guarded() {
        let (ledger, audit) = ledger();
        ledger
            .record_placement(&Placement::new("7/500", "R1", "F2", &["10"], 300), "clerk")
            .unwrap();

        assert!(!ledger.decrement("7/500", "R1", "F2", 350, "clerk").unwrap());
        assert_eq!(ledger.total_quantity("7/500").unwrap(), 300);

        assert!(ledger.decrement("7/500", "R1", "F2", 300, "clerk").unwrap());
        assert_eq!(ledger.total_quantity("7/500").unwrap(), 0);
        assert!(!ledger.decrement("7/500", "R1", "F2", 1, "clerk").unwrap());
        assert!(!ledger.decrement("7/500", "R9", "F2", 1, "clerk").unwrap());

        assert!(matches!(
            ledger.decrement("7/500", "R1", "F2", 0, "clerk"),
            Err(CoreError::Validation(_))
        ));
        let decrements = audit
            .actions()
            .into_iter()
            .filter(|a| *a == AuditAction::AllocationDecremented)
            .count();
        assert_eq!(decrements, 1);
    }

    #[test]
    fn test_decrement_keeps_breakdown_in_step() {
        let (ledger, _) = ledger();
        let row = ledger
            .record_placement(
                &Placement::new("7/500", "R1", "F2", &["10", "11", "12"], 500)
                    .with_breakdown(vec![200, 200, 100]),
                "clerk",
            )
            .unwrap();
        assert!(ledger.decrement("7/500", "R1", "F2", 250, "clerk").unwrap());

        let row = ledger.allocation(row.id).unwrap();
        assert_eq!(row.quantity, 250);
        assert_eq!(row.breakdown, Some(vec![0, 150, 100]));
        let per_slot: i64 = row.per_slot(200).iter().map(|(_, q)| q).sum();
        assert_eq!(per_slot, 250);
    }

    #[test]
    fn test_occupancy_renders_each_gatar() {
        let (ledger, _) = ledger();
        ledger
            .record_placement(
                &Placement::new("7/500", "R1", "F2", &["10", "11", "12"], 500)
                    .with_breakdown(vec![200, 200, 100]),
                "clerk",
            )
            .unwrap();
        ledger
            .record_placement(&Placement::new("8/40", "R1", "F2", &["13", "14"], 41), "clerk")
            .unwrap();

        let occupancy = ledger.occupancy("R1", "F2").unwrap();
        let quantities: Vec<(&str, i64)> = occupancy
            .iter()
            .map(|o| (o.slot.as_str(), o.quantity))
            .collect();
        assert_eq!(
            quantities,
            vec![("10", 200), ("11", 200), ("12", 100), ("13", 21), ("14", 20)]
        );
        assert!(ledger.occupancy("R2", "F2").unwrap().is_empty());
    }

    #[test]
    fn test_edit_and_delete_are_audited() {
        let (ledger, audit) = ledger();
        let row = ledger
            .record_placement(&Placement::new("7/500", "R1", "F2", &["10"], 300), "clerk")
            .unwrap();

        let edited = ledger
            .edit_allocation(
                row.id,
                &Placement::new("7/500", "R2", "F1", &["3", "4"], 280).with_remark("recount"),
                "admin",
            )
            .unwrap();
        assert_eq!(edited.room, "R2");
        assert_eq!(edited.quantity, 280);
        assert_eq!(edited.remark, "recount");

        ledger.delete_allocation(row.id, "admin").unwrap();
        assert!(matches!(ledger.allocation(row.id), Err(CoreError::NotFound(_))));
        assert!(matches!(
            ledger.delete_allocation(row.id, "admin"),
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(
            audit.actions(),
            vec![
                AuditAction::PlacementRecorded,
                AuditAction::AllocationEdited,
                AuditAction::AllocationDeleted
            ]
        );
    }
}
