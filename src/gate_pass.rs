//! Gate passes (withdrawal authorizations)
//!
//! ```text
//! pending ──approve──▶ approved ──pickup──▶ partially_completed ──pickup──▶ completed
//!    │                    │  └──────────────pickup (full)─────────────────────▲
//!    ├──reject──▶ rejected│
//!    └──sweep───▶ expired ◀──sweep
//! ```
//!
//! Approval reserves nothing. Two passes for the same consignment can together be approved
//! for more than the ledger holds; the loser finds out at pickup time, when the guarded
//! decrement refuses it.
//!
//! The transition rules live on [`GatePass`] as plain methods over `now`, so they are
//! checked the same way by the service, the pickup recorder and the sweeper.

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::clock::Clock;
use crate::config::GatePassConfig;
use crate::error::CoreError;
use crate::store::Store;
use crate::sweeper::ExpirySweeper;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePassStatus {
    Pending,
    Approved,
    PartiallyCompleted,
    Completed,
    Rejected,
    Expired,
}

impl GatePassStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GatePassStatus::Pending => "pending",
            GatePassStatus::Approved => "approved",
            GatePassStatus::PartiallyCompleted => "partially_completed",
            GatePassStatus::Completed => "completed",
            GatePassStatus::Rejected => "rejected",
            GatePassStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GatePassStatus::Completed | GatePassStatus::Rejected | GatePassStatus::Expired
        )
    }

    /// Whether pickups may be recorded in this state.
    pub fn accepts_pickups(self) -> bool {
        matches!(
            self,
            GatePassStatus::Approved | GatePassStatus::PartiallyCompleted
        )
    }

    pub fn can_transition_to(self, next: GatePassStatus) -> bool {
        use GatePassStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Approved, PartiallyCompleted)
                | (Approved, Completed)
                | (Approved, Expired)
                | (PartiallyCompleted, PartiallyCompleted)
                | (PartiallyCompleted, Completed)
        )
    }
}

impl fmt::Display for GatePassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatePassStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GatePassStatus::Pending),
            "approved" => Ok(GatePassStatus::Approved),
            "partially_completed" => Ok(GatePassStatus::PartiallyCompleted),
            "completed" => Ok(GatePassStatus::Completed),
            "rejected" => Ok(GatePassStatus::Rejected),
            "expired" => Ok(GatePassStatus::Expired),
            other => Err(format!("unknown gate pass status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePass {
    pub id: Uuid,
    pub consignment_code: String,
    pub requested_quantity: i64,
    pub approved_quantity: Option<i64>,
    pub final_approved_quantity: Option<i64>,
    pub gate: Option<String>,
    pub status: GatePassStatus,
    pub payment_verified: bool,
    pub payment_amount: Option<Decimal>,
    pub total_picked_up: i64,
    pub requested_by: String,
    pub approved_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// Approval deadline.
    pub expires_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    /// Pickup deadline, set on approval.
    pub approval_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl GatePass {
    /// A new pending pass that lapses `config.issuance_window()` after `now`.
    ///
    /// # Errors
    ///
    /// `Validation` for a non-positive quantity or missing fields.
    pub fn issue(
        consignment_code: &str,
        requested_quantity: i64,
        requested_by: &str,
        now: DateTime<Utc>,
        config: &GatePassConfig,
    ) -> Result<Self, CoreError> {
        if requested_quantity <= 0 {
            return Err(CoreError::validation("requested quantity must be positive"));
        }
        require("consignment code", consignment_code)?;
        require("requester", requested_by)?;

        Ok(Self {
            id: Uuid::new_v4(),
            consignment_code: consignment_code.to_string(),
            requested_quantity,
            approved_quantity: None,
            final_approved_quantity: None,
            gate: None,
            status: GatePassStatus::Pending,
            payment_verified: false,
            payment_amount: None,
            total_picked_up: 0,
            requested_by: requested_by.to_string(),
            approved_by: None,
            rejection_reason: None,
            issued_at: now,
            expires_at: now + config.issuance_window(),
            approved_at: None,
            approval_expires_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    /// Quantity currently authorized: the revised figure when there is one.
    pub fn effective_approved_quantity(&self) -> Option<i64> {
        self.final_approved_quantity.or(self.approved_quantity)
    }

    /// Whether the deadline that applies to the current status has passed.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            GatePassStatus::Pending => now > self.expires_at,
            GatePassStatus::Approved | GatePassStatus::PartiallyCompleted => self
                .approval_expires_at
                .is_some_and(|deadline| now > deadline),
            _ => false,
        }
    }

    fn move_to(&mut self, next: GatePassStatus, now: DateTime<Utc>) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::conflict(format!(
                "gate pass {} is {}, cannot move to {next}",
                self.id, self.status
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_not_lapsed(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.is_past_deadline(now) {
            let deadline = match self.status {
                GatePassStatus::Pending => Some(self.expires_at),
                _ => self.approval_expires_at,
            };
            return Err(CoreError::Expired(format!(
                "gate pass {} passed its {} deadline{}",
                self.id,
                if self.status == GatePassStatus::Pending {
                    "approval"
                } else {
                    "pickup"
                },
                deadline.map(|d| format!(" at {d}")).unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// `pending → approved`.
    ///
    /// # Errors
    ///
    /// `Validation` for bad input or self-approval, `Conflict` when not pending or payment
    /// is required but missing, `Expired` past the approval deadline.
    pub fn approve(
        &mut self,
        approver: &str,
        quantity: i64,
        gate: &str,
        now: DateTime<Utc>,
        config: &GatePassConfig,
    ) -> Result<(), CoreError> {
        require("approver", approver)?;
        require("gate", gate)?;
        if quantity <= 0 {
            return Err(CoreError::validation("approved quantity must be positive"));
        }
        if quantity > self.requested_quantity {
            return Err(CoreError::validation(format!(
                "approved quantity {quantity} exceeds requested {}",
                self.requested_quantity
            )));
        }
        if approver == self.requested_by {
            return Err(CoreError::validation(
                "a gate pass cannot be approved by its requester",
            ));
        }
        if self.status != GatePassStatus::Pending {
            return Err(CoreError::conflict(format!(
                "gate pass {} is {}, only pending passes can be approved",
                self.id, self.status
            )));
        }
        self.ensure_not_lapsed(now)?;
        if config.require_payment_before_approval && !self.payment_verified {
            return Err(CoreError::conflict(format!(
                "gate pass {} has no verified payment",
                self.id
            )));
        }

        self.move_to(GatePassStatus::Approved, now)?;
        self.approved_quantity = Some(quantity);
        self.gate = Some(gate.to_string());
        self.approved_by = Some(approver.to_string());
        self.approved_at = Some(now);
        self.approval_expires_at = Some(now + config.approval_window());
        Ok(())
    }

    /// `pending → rejected`.
    ///
    /// # Errors
    ///
    /// `Validation` without a reason, `Conflict` when not pending, `Expired` when lapsed.
    pub fn reject(&mut self, actor: &str, reason: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        require("actor", actor)?;
        require("rejection reason", reason)?;
        if self.status != GatePassStatus::Pending {
            return Err(CoreError::conflict(format!(
                "gate pass {} is {}, only pending passes can be rejected",
                self.id, self.status
            )));
        }
        self.ensure_not_lapsed(now)?;
        self.move_to(GatePassStatus::Rejected, now)?;
        self.rejection_reason = Some(reason.to_string());
        Ok(())
    }

    /// Replace the authorized quantity on an approved pass.
    ///
    /// # Errors
    ///
    /// `Validation` for a quantity that is not positive, above the request, or below what
    /// has already been picked up; `Conflict` outside approved/partially completed.
    pub fn revise(&mut self, final_quantity: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        if final_quantity <= 0 {
            return Err(CoreError::validation("final quantity must be positive"));
        }
        if final_quantity > self.requested_quantity {
            return Err(CoreError::validation(format!(
                "final quantity {final_quantity} exceeds requested {}",
                self.requested_quantity
            )));
        }
        if final_quantity < self.total_picked_up {
            return Err(CoreError::validation(format!(
                "final quantity {final_quantity} is below the {} already picked up",
                self.total_picked_up
            )));
        }
        if !self.status.accepts_pickups() {
            return Err(CoreError::conflict(format!(
                "gate pass {} is {}, only approved passes can be revised",
                self.id, self.status
            )));
        }
        self.final_approved_quantity = Some(final_quantity);
        self.updated_at = now;
        Ok(())
    }

    /// # Errors
    ///
    /// `Validation` for a negative amount, `Conflict` on a terminal pass.
    pub fn verify_payment(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), CoreError> {
        if amount.is_sign_negative() {
            return Err(CoreError::validation("payment amount cannot be negative"));
        }
        if self.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "gate pass {} is {}",
                self.id, self.status
            )));
        }
        self.payment_verified = true;
        self.payment_amount = Some(amount);
        self.updated_at = now;
        Ok(())
    }

    /// Preconditions for recording a pickup of `quantity`.
    ///
    /// # Errors
    ///
    /// `Validation` for a non-positive quantity, `Conflict` outside
    /// approved/partially completed or beyond what the pass still authorizes,
    /// `Expired` past the pickup deadline.
    pub fn check_pickup(&self, quantity: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        if quantity <= 0 {
            return Err(CoreError::validation("pickup quantity must be positive"));
        }
        if !self.status.accepts_pickups() {
            return Err(CoreError::conflict(format!(
                "gate pass {} is {}, pickups need an approved pass",
                self.id, self.status
            )));
        }
        self.ensure_not_lapsed(now)?;

        let remaining = self.remaining_authorized();
        if quantity > remaining {
            return Err(CoreError::conflict(format!(
                "gate pass {} authorizes {remaining} more, cannot pick up {quantity}",
                self.id
            )));
        }
        Ok(())
    }

    /// Units still withdrawable: the authorized quantity (never above the request) less
    /// what has been picked up.
    pub fn remaining_authorized(&self) -> i64 {
        let authorized = self
            .effective_approved_quantity()
            .map_or(self.requested_quantity, |q| q.min(self.requested_quantity));
        (authorized - self.total_picked_up).max(0)
    }

    /// Adopt the recomputed pickup total and advance the fulfillment state.
    ///
    /// # Errors
    ///
    /// `Conflict` if the pass does not accept pickups.
    pub fn apply_picked_total(&mut self, total: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        if total >= self.requested_quantity {
            self.move_to(GatePassStatus::Completed, now)?;
            if self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else if total > 0 {
            self.move_to(GatePassStatus::PartiallyCompleted, now)?;
        }
        self.total_picked_up = total;
        self.updated_at = now;
        Ok(())
    }

    /// `pending`/`approved → expired` once past the relevant deadline. Returns whether the
    /// pass changed; partially completed passes never expire.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let lapsed = match self.status {
            GatePassStatus::Pending | GatePassStatus::Approved => self.is_past_deadline(now),
            _ => false,
        };
        if lapsed {
            self.status = GatePassStatus::Expired;
            self.updated_at = now;
        }
        lapsed
    }
}

fn require(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} is required")));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatePassFilter {
    pub consignment_code: Option<String>,
    pub status: Option<GatePassStatus>,
}

impl GatePassFilter {
    pub fn for_consignment(code: impl Into<String>) -> Self {
        Self {
            consignment_code: Some(code.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: GatePassStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, pass: &GatePass) -> bool {
        self.consignment_code
            .as_deref()
            .map_or(true, |code| code == pass.consignment_code)
            && self.status.map_or(true, |status| status == pass.status)
    }
}

pub struct GatePassService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    config: GatePassConfig,
    sweeper: ExpirySweeper<S>,
    sweep_on_read: bool,
}

impl<S: Store> GatePassService<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: GatePassConfig,
    ) -> Self {
        let sweeper = ExpirySweeper::new(store.clone(), clock.clone(), audit.clone());
        Self {
            store,
            clock,
            audit,
            config,
            sweeper,
            sweep_on_read: true,
        }
    }

    /// Toggle the expiry sweep that runs before every [`list`](Self::list).
    pub fn with_sweep_on_read(mut self, enabled: bool) -> Self {
        self.sweep_on_read = enabled;
        self
    }

    pub fn config(&self) -> &GatePassConfig {
        &self.config
    }

    /// Request a withdrawal of `requested_quantity` units of a consignment.
    ///
    /// # Errors
    ///
    /// `Validation` for bad input, `NotFound` when the consignment has nothing in storage,
    /// `Conflict` when the request exceeds the stock on record.
    pub fn create(
        &self,
        consignment_code: &str,
        requested_quantity: i64,
        requested_by: &str,
    ) -> Result<GatePass, CoreError> {
        let now = self.clock.now();
        let pass = GatePass::issue(
            consignment_code,
            requested_quantity,
            requested_by,
            now,
            &self.config,
        )?;

        self.store.atomically(|ops| {
            let available = ops.total_quantity(consignment_code)?.ok_or_else(|| {
                CoreError::not_found(format!("consignment {consignment_code} has no stock on record"))
            })?;
            if requested_quantity > available {
                return Err(CoreError::conflict(format!(
                    "requested {requested_quantity} of {consignment_code} but only {available} in storage"
                )));
            }
            ops.insert_gate_pass(&pass)?;
            Ok(())
        })?;

        #[cfg(feature = "metrics")]
        METRICS.record_transition(GatePassStatus::Pending.as_str());
        log::info!(
            "gate pass {} requested for {requested_quantity} of {consignment_code}",
            pass.id
        );
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                requested_by,
                AuditAction::GatePassCreated,
                format!("requested gate pass for {requested_quantity} of {consignment_code}"),
                now,
            )
            .with_details(json!({ "gate_pass_id": pass.id, "expires_at": pass.expires_at })),
        );
        Ok(pass)
    }

    /// # Errors
    ///
    /// See [`GatePass::approve`]; `NotFound` for an unknown id.
    pub fn approve(
        &self,
        id: Uuid,
        approver: &str,
        quantity: i64,
        gate: &str,
    ) -> Result<GatePass, CoreError> {
        let pass = self.transition(id, |pass, now| {
            pass.approve(approver, quantity, gate, now, &self.config)
        })?;
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                approver,
                AuditAction::GatePassApproved,
                format!(
                    "approved gate pass {id} for {quantity} of {} at gate {gate}",
                    pass.consignment_code
                ),
                pass.updated_at,
            )
            .with_details(json!({ "approval_expires_at": pass.approval_expires_at })),
        );
        Ok(pass)
    }

    /// # Errors
    ///
    /// See [`GatePass::reject`]; `NotFound` for an unknown id.
    pub fn reject(&self, id: Uuid, actor: &str, reason: &str) -> Result<GatePass, CoreError> {
        let pass = self.transition(id, |pass, now| pass.reject(actor, reason, now))?;
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::GatePassRejected,
                format!("rejected gate pass {id}: {reason}"),
                pass.updated_at,
            ),
        );
        Ok(pass)
    }

    /// # Errors
    ///
    /// See [`GatePass::revise`]; `NotFound` for an unknown id.
    pub fn revise_approval(
        &self,
        id: Uuid,
        final_quantity: i64,
        actor: &str,
    ) -> Result<GatePass, CoreError> {
        let pass = self.transition(id, |pass, now| pass.revise(final_quantity, now))?;
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::ApprovalRevised,
                format!(
                    "revised gate pass {id} from {:?} to {final_quantity}",
                    pass.approved_quantity
                ),
                pass.updated_at,
            ),
        );
        Ok(pass)
    }

    /// # Errors
    ///
    /// See [`GatePass::verify_payment`]; `NotFound` for an unknown id.
    pub fn verify_payment(
        &self,
        id: Uuid,
        amount: Decimal,
        actor: &str,
    ) -> Result<GatePass, CoreError> {
        let pass = self.transition(id, |pass, now| pass.verify_payment(amount, now))?;
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::PaymentVerified,
                format!("verified payment of {amount} for gate pass {id}"),
                pass.updated_at,
            ),
        );
        Ok(pass)
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn get(&self, id: Uuid) -> Result<GatePass, CoreError> {
        self.store
            .with_ops(|ops| Ok(ops.gate_pass(id)?))?
            .ok_or_else(|| CoreError::not_found(format!("gate pass {id}")))
    }

    /// Gate passes matching `filter`, newest first. Stale passes are expired first when
    /// sweep-on-read is enabled; a failing sweep is logged and the listing still returns.
    ///
    /// # Errors
    ///
    /// Storage failures from the listing itself.
    pub fn list(&self, filter: &GatePassFilter) -> Result<Vec<GatePass>, CoreError> {
        if self.sweep_on_read {
            if let Err(e) = self.sweeper.sweep(self.clock.now()) {
                log::warn!("lazy expiry sweep failed: {e}");
            }
        }
        self.store.with_ops(|ops| Ok(ops.list_gate_passes(filter)?))
    }

    /// Load, mutate and conditionally write back one pass inside a transaction.
    fn transition<F>(&self, id: Uuid, mutate: F) -> Result<GatePass, CoreError>
    where
        F: FnOnce(&mut GatePass, DateTime<Utc>) -> Result<(), CoreError>,
    {
        let now = self.clock.now();
        let pass = self.store.atomically(|ops| {
            let mut pass = ops
                .gate_pass_for_update(id)?
                .ok_or_else(|| CoreError::not_found(format!("gate pass {id}")))?;
            let loaded = pass.status;
            mutate(&mut pass, now)?;
            if !ops.update_gate_pass(&pass, loaded)? {
                return Err(CoreError::conflict(format!(
                    "gate pass {id} changed while it was being updated"
                )));
            }
            Ok(pass)
        })?;

        #[cfg(feature = "metrics")]
        METRICS.record_transition(pass.status.as_str());
        log::debug!("gate pass {id} is now {}", pass.status);
        Ok(pass)
    }
}
