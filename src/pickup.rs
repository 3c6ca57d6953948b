//! Recording physical withdrawals against an approved gate pass
//!
//! One pickup is one transaction: lock the pass, check its state and deadline, take the
//! quantity out of the ledger with the guarded decrement, append the pickup record,
//! recompute the pass total from the records and move the pass forward. Any failure
//! along the way leaves the ledger, the pass and the pickup history untouched.

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::gate_pass::{GatePass, GatePassStatus};
use crate::ledger::apply_decrement;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupRecord {
    pub id: Uuid,
    pub gate_pass_id: Uuid,
    pub quantity: i64,
    pub room: String,
    pub floor: String,
    pub slot: Option<String>,
    pub picked_at: DateTime<Utc>,
    pub picked_by: String,
}

pub struct PickupRecorder<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    slot_capacity: i64,
}

impl<S: Store> PickupRecorder<S> {
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

    /// Withdraw `quantity` units from (room, floor), optionally from a named gatar, against
    /// gate pass `id`. Returns the pass as it stands after the pickup.
    ///
    /// # Errors
    ///
    /// - `Validation` for bad input;
    /// - `NotFound` for an unknown pass;
    /// - `Conflict` when the pass does not accept pickups or no row at the location holds
    ///   `quantity` units;
    /// - `Expired` past the pickup deadline.
    pub fn record_pickup(
        &self,
        id: Uuid,
        quantity: i64,
        room: &str,
        floor: &str,
        slot: Option<&str>,
        actor: &str,
    ) -> Result<GatePass, CoreError> {
        if quantity <= 0 {
            return Err(CoreError::validation("pickup quantity must be positive"));
        }
        for (field, value) in [("room", room), ("floor", floor), ("actor", actor)] {
            if value.trim().is_empty() {
                return Err(CoreError::validation(format!("{field} is required")));
            }
        }
        let slot = slot.map(str::trim).filter(|s| !s.is_empty());

        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::pickup_span(&id, quantity).entered();

        let now = self.clock.now();
        let capacity = self.slot_capacity;
        let outcome = self.store.atomically(|ops| {
            let mut pass = ops
                .gate_pass_for_update(id)?
                .ok_or_else(|| CoreError::not_found(format!("gate pass {id}")))?;
            pass.check_pickup(quantity, now)?;
            let loaded = pass.status;

            let row = apply_decrement(
                ops,
                &pass.consignment_code,
                room,
                floor,
                slot,
                quantity,
                capacity,
                now,
            )?
            .ok_or_else(|| {
                CoreError::conflict(format!(
                    "insufficient stock: no allocation of {} in room {room} floor {floor} holds {quantity}",
                    pass.consignment_code
                ))
            })?;

            let record = PickupRecord {
                id: Uuid::new_v4(),
                gate_pass_id: id,
                quantity,
                room: room.to_string(),
                floor: floor.to_string(),
                slot: slot.map(str::to_string),
                picked_at: now,
                picked_by: actor.to_string(),
            };
            ops.insert_pickup(&record)?;

            let total = ops.picked_total(id)?;
            pass.apply_picked_total(total, now)?;
            if !ops.update_gate_pass(&pass, loaded)? {
                return Err(CoreError::conflict(format!(
                    "gate pass {id} changed while the pickup was being recorded"
                )));
            }
            Ok((pass, row.id, row.quantity))
        });

        let (pass, allocation_id, remaining) = match outcome {
            Ok(done) => done,
            Err(e) => {
                #[cfg(feature = "metrics")]
                if e.is_conflict() {
                    METRICS.record_pickup_conflict();
                }
                log::warn!("pickup of {quantity} against gate pass {id} refused: {e}");
                return Err(e);
            }
        };

        #[cfg(feature = "metrics")]
        {
            METRICS.record_pickup(quantity);
            METRICS.record_transition(pass.status.as_str());
        }
        log::info!(
            "picked up {quantity} of {} against gate pass {id} ({} of {} done, {})",
            pass.consignment_code,
            pass.total_picked_up,
            pass.requested_quantity,
            pass.status
        );
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::PickupRecorded,
                format!(
                    "picked up {quantity} of {} from room {room} floor {floor}",
                    pass.consignment_code
                ),
                now,
            )
            .with_details(json!({
                "gate_pass_id": id,
                "allocation_id": allocation_id,
                "remaining": remaining,
                "total_picked_up": pass.total_picked_up,
                "completed": pass.status == GatePassStatus::Completed,
            })),
        );
        Ok(pass)
    }

    /// Pickup history of a gate pass, oldest first.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown pass.
    pub fn pickups_for(&self, id: Uuid) -> Result<Vec<PickupRecord>, CoreError> {
        self.store.with_ops(|ops| {
            if ops.gate_pass(id)?.is_none() {
                return Err(CoreError::not_found(format!("gate pass {id}")));
            }
            Ok(ops.pickups_for(id)?)
        })
    }
}
