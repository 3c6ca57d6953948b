//! Admin action log
//!
//! Every mutating operation emits one [`AuditEntry`] after its own write has committed.
//! Delivery is fire-and-forget: [`emit`] logs a failing sink and carries on, so a broken
//! audit table never rolls back or fails a ledger operation.

use crate::executor::{DbError, StoreExecutor};
use crate::pool::ConnectionPool;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConsignmentRegistered,
    CustomerRelinked,
    PlacementRecorded,
    AllocationDecremented,
    AllocationEdited,
    AllocationDeleted,
    GatePassCreated,
    GatePassApproved,
    GatePassRejected,
    ApprovalRevised,
    PaymentVerified,
    PickupRecorded,
    GatePassesExpired,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ConsignmentRegistered => "consignment_registered",
            AuditAction::CustomerRelinked => "customer_relinked",
            AuditAction::PlacementRecorded => "placement_recorded",
            AuditAction::AllocationDecremented => "allocation_decremented",
            AuditAction::AllocationEdited => "allocation_edited",
            AuditAction::AllocationDeleted => "allocation_deleted",
            AuditAction::GatePassCreated => "gate_pass_created",
            AuditAction::GatePassApproved => "gate_pass_approved",
            AuditAction::GatePassRejected => "gate_pass_rejected",
            AuditAction::ApprovalRevised => "approval_revised",
            AuditAction::PaymentVerified => "payment_verified",
            AuditAction::PickupRecorded => "pickup_recorded",
            AuditAction::GatePassesExpired => "gate_passes_expired",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: AuditAction,
    pub description: String,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            actor: actor.into(),
            action,
            description: description.into(),
            details: serde_json::Value::Null,
            at,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

pub trait AuditSink: Send + Sync {
    /// # Errors
    ///
    /// Returns `DbError` when the entry could not be stored.
    fn record(&self, entry: &AuditEntry) -> Result<(), DbError>;
}

/// Hand `entry` to `sink`, swallowing failures.
pub fn emit(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(e) = sink.record(&entry) {
        log::warn!(
            "audit entry '{}' by {} dropped: {e}",
            entry.action.as_str(),
            entry.actor
        );
    }
}

/// Appends to the `admin_action_log` table.
pub struct PgAuditLog {
    pool: Arc<ConnectionPool>,
}

impl PgAuditLog {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<(), DbError> {
        let conn = self.pool.acquire()?;
        conn.execute(
            "INSERT INTO admin_action_log (actor, action, description, details, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &entry.actor,
                &entry.action.as_str(),
                &entry.description,
                &entry.details,
                &entry.at,
            ],
        )?;
        Ok(())
    }
}

/// Writes entries to the `log` facade only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAudit;

impl AuditSink for LogAudit {
    fn record(&self, entry: &AuditEntry) -> Result<(), DbError> {
        log::info!(
            target: "coldstore::audit",
            "{} {}: {}",
            entry.actor,
            entry.action.as_str(),
            entry.description
        );
        Ok(())
    }
}

/// Keeps entries in memory so tests can inspect them.
#[cfg(any(test, feature = "mock"))]
#[derive(Debug, Default)]
pub struct MemoryAudit {
    entries: std::sync::Mutex<Vec<AuditEntry>>,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "mock"))]
impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.entries().iter().map(|e| e.action).collect()
    }

    /// Make every subsequent `record` fail.
    pub fn fail(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "mock"))]
impl AuditSink for MemoryAudit {
    fn record(&self, entry: &AuditEntry) -> Result<(), DbError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DbError::Other("audit sink unavailable".to_string()));
        }
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
