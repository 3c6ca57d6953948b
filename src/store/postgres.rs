//! PostgreSQL [`Store`] over the connection pool
//!
//! `with_ops` checks a connection out for the duration of the closure. `atomically`
//! additionally opens a transaction on it, commits on `Ok` and rolls back on `Err`.

use super::{Store, StoreOps};
use crate::consignment::{Category, Consignment};
use crate::error::CoreError;
use crate::executor::{DbError, StoreExecutor};
use crate::gatar;
use crate::gate_pass::{GatePass, GatePassFilter, GatePassStatus};
use crate::ledger::{Placement, StorageAllocation};
use crate::pickup::PickupRecord;
use crate::pool::ConnectionPool;
use crate::transaction::IsolationLevel;
use chrono::{DateTime, Utc};
use may_postgres::types::FromSql;
use may_postgres::Row;
use std::sync::Arc;
use uuid::Uuid;

const ALLOCATION_COLUMNS: &str =
    "id, consignment_code, room, floor, slots, quantity, breakdown, remark, created_at, updated_at";

const GATE_PASS_COLUMNS: &str = "id, consignment_code, requested_quantity, approved_quantity, \
     final_approved_quantity, gate, status, payment_verified, payment_amount, total_picked_up, \
     requested_by, approved_by, rejection_reason, issued_at, expires_at, approved_at, \
     approval_expires_at, completed_at, updated_at";

const PICKUP_COLUMNS: &str = "id, gate_pass_id, quantity, room, floor, slot, picked_at, picked_by";

pub struct PgStore {
    pool: Arc<ConnectionPool>,
    isolation: IsolationLevel,
}

impl PgStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::default(),
        }
    }

    /// Isolation level for `atomically`; `READ COMMITTED` unless set.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Store for PgStore {
    fn with_ops<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn StoreOps) -> Result<T, CoreError>,
    {
        let conn = self.pool.acquire()?;
        f(&PgOps::new(&*conn))
    }

    fn atomically<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn StoreOps) -> Result<T, CoreError>,
    {
        let conn = self.pool.acquire()?;
        let tx = conn
            .begin_with_isolation(self.isolation)
            .map_err(DbError::from)?;

        let result = f(&PgOps::new(&tx));
        match result {
            Ok(value) => {
                tx.commit().map_err(DbError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::warn!("rollback after '{e}' failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

/// `StoreOps` as SQL against any executor, pooled connection or open transaction.
pub struct PgOps<E> {
    exec: E,
}

impl<E: StoreExecutor> PgOps<E> {
    pub fn new(exec: E) -> Self {
        Self { exec }
    }
}

fn col<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> Result<T, DbError> {
    row.try_get(name)
        .map_err(|e| DbError::ParseError(format!("column {name}: {e}")))
}

fn allocation_from_row(row: &Row) -> Result<StorageAllocation, DbError> {
    let slots: String = col(row, "slots")?;
    let breakdown = match col::<Option<String>>(row, "breakdown")? {
        Some(encoded) => gatar::parse_breakdown(&encoded).map_err(DbError::ParseError)?,
        None => None,
    };
    Ok(StorageAllocation {
        id: col(row, "id")?,
        consignment_code: col(row, "consignment_code")?,
        room: col(row, "room")?,
        floor: col(row, "floor")?,
        slots: gatar::parse_slots(&slots),
        quantity: col(row, "quantity")?,
        breakdown,
        remark: col(row, "remark")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn consignment_from_row(row: &Row) -> Result<Consignment, DbError> {
    let category: String = col(row, "category")?;
    Ok(Consignment {
        code: col(row, "code")?,
        category: category.parse().map_err(DbError::ParseError)?,
        expected_quantity: col(row, "expected_quantity")?,
        customer_ref: col(row, "customer_ref")?,
        created_at: col(row, "created_at")?,
    })
}

fn gate_pass_from_row(row: &Row) -> Result<GatePass, DbError> {
    let status: String = col(row, "status")?;
    Ok(GatePass {
        id: col(row, "id")?,
        consignment_code: col(row, "consignment_code")?,
        requested_quantity: col(row, "requested_quantity")?,
        approved_quantity: col(row, "approved_quantity")?,
        final_approved_quantity: col(row, "final_approved_quantity")?,
        gate: col(row, "gate")?,
        status: status.parse().map_err(DbError::ParseError)?,
        payment_verified: col(row, "payment_verified")?,
        payment_amount: col(row, "payment_amount")?,
        total_picked_up: col(row, "total_picked_up")?,
        requested_by: col(row, "requested_by")?,
        approved_by: col(row, "approved_by")?,
        rejection_reason: col(row, "rejection_reason")?,
        issued_at: col(row, "issued_at")?,
        expires_at: col(row, "expires_at")?,
        approved_at: col(row, "approved_at")?,
        approval_expires_at: col(row, "approval_expires_at")?,
        completed_at: col(row, "completed_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn pickup_from_row(row: &Row) -> Result<PickupRecord, DbError> {
    Ok(PickupRecord {
        id: col(row, "id")?,
        gate_pass_id: col(row, "gate_pass_id")?,
        quantity: col(row, "quantity")?,
        room: col(row, "room")?,
        floor: col(row, "floor")?,
        slot: col(row, "slot")?,
        picked_at: col(row, "picked_at")?,
        picked_by: col(row, "picked_by")?,
    })
}

fn map_rows<T>(rows: Vec<Row>, f: fn(&Row) -> Result<T, DbError>) -> Result<Vec<T>, DbError> {
    rows.iter().map(f).collect()
}

impl<E: StoreExecutor> StoreOps for PgOps<E> {
    fn insert_allocation(
        &self,
        placement: &Placement,
        now: DateTime<Utc>,
    ) -> Result<StorageAllocation, DbError> {
        let slots = gatar::format_slots(&placement.slots);
        let breakdown = placement.breakdown.as_deref().map(gatar::format_breakdown);
        let row = self.exec.query_one(
            &format!(
                "INSERT INTO room_entries \
                 (consignment_code, room, floor, slots, quantity, breakdown, remark, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING {ALLOCATION_COLUMNS}"
            ),
            &[
                &placement.consignment_code,
                &placement.room,
                &placement.floor,
                &slots,
                &placement.quantity,
                &breakdown,
                &placement.remark,
                &now,
            ],
        )?;
        allocation_from_row(&row)
    }

    fn allocation(&self, id: i64) -> Result<Option<StorageAllocation>, DbError> {
        self.exec
            .query_opt(
                &format!("SELECT {ALLOCATION_COLUMNS} FROM room_entries WHERE id = $1"),
                &[&id],
            )?
            .as_ref()
            .map(allocation_from_row)
            .transpose()
    }

    fn allocations_for(&self, consignment_code: &str) -> Result<Vec<StorageAllocation>, DbError> {
        let rows = self.exec.query_all(
            &format!(
                "SELECT {ALLOCATION_COLUMNS} FROM room_entries WHERE consignment_code = $1 ORDER BY id"
            ),
            &[&consignment_code],
        )?;
        map_rows(rows, allocation_from_row)
    }

    fn allocations_at(&self, room: &str, floor: &str) -> Result<Vec<StorageAllocation>, DbError> {
        let rows = self.exec.query_all(
            &format!(
                "SELECT {ALLOCATION_COLUMNS} FROM room_entries WHERE room = $1 AND floor = $2 ORDER BY id"
            ),
            &[&room, &floor],
        )?;
        map_rows(rows, allocation_from_row)
    }

    fn total_quantity(&self, consignment_code: &str) -> Result<Option<i64>, DbError> {
        let row = self.exec.query_one(
            "SELECT SUM(quantity)::BIGINT AS total FROM room_entries WHERE consignment_code = $1",
            &[&consignment_code],
        )?;
        col(&row, "total")
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
        // The outer guard re-checks the quantity after the row lock is taken.
        let row = self.exec.query_opt(
            &format!(
                "UPDATE room_entries SET quantity = quantity - $5, updated_at = $6 \
                 WHERE id = ( \
                     SELECT id FROM room_entries \
                     WHERE consignment_code = $1 AND room = $2 AND floor = $3 AND quantity >= $5 \
                     ORDER BY (',' || slots || ',') LIKE ('%,' || COALESCE($4::TEXT, '') || ',%') DESC, id \
                     LIMIT 1 FOR UPDATE \
                 ) AND quantity >= $5 \
                 RETURNING {ALLOCATION_COLUMNS}"
            ),
            &[&consignment_code, &room, &floor, &slot, &amount, &now],
        )?;
        row.as_ref().map(allocation_from_row).transpose()
    }

    fn set_breakdown(&self, id: i64, breakdown: Option<&[i64]>) -> Result<(), DbError> {
        let encoded = breakdown.map(gatar::format_breakdown);
        self.exec.execute(
            "UPDATE room_entries SET breakdown = $2 WHERE id = $1",
            &[&id, &encoded],
        )?;
        Ok(())
    }

    fn replace_allocation(
        &self,
        id: i64,
        placement: &Placement,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let slots = gatar::format_slots(&placement.slots);
        let breakdown = placement.breakdown.as_deref().map(gatar::format_breakdown);
        let updated = self.exec.execute(
            "UPDATE room_entries SET consignment_code = $2, room = $3, floor = $4, slots = $5, \
             quantity = $6, breakdown = $7, remark = $8, updated_at = $9 WHERE id = $1",
            &[
                &id,
                &placement.consignment_code,
                &placement.room,
                &placement.floor,
                &slots,
                &placement.quantity,
                &breakdown,
                &placement.remark,
                &now,
            ],
        )?;
        Ok(updated > 0)
    }

    fn delete_allocation(&self, id: i64) -> Result<bool, DbError> {
        Ok(self
            .exec
            .execute("DELETE FROM room_entries WHERE id = $1", &[&id])?
            > 0)
    }

    fn count_consignments(&self, category: Category) -> Result<i64, DbError> {
        let row = self.exec.query_one(
            "SELECT COUNT(*) AS n FROM consignments WHERE category = $1",
            &[&category.as_str()],
        )?;
        col(&row, "n")
    }

    fn insert_consignment(&self, consignment: &Consignment) -> Result<(), DbError> {
        self.exec.execute(
            "INSERT INTO consignments (code, category, expected_quantity, customer_ref, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &consignment.code,
                &consignment.category.as_str(),
                &consignment.expected_quantity,
                &consignment.customer_ref,
                &consignment.created_at,
            ],
        )?;
        Ok(())
    }

    fn consignment(&self, code: &str) -> Result<Option<Consignment>, DbError> {
        self.exec
            .query_opt(
                "SELECT code, category, expected_quantity, customer_ref, created_at \
                 FROM consignments WHERE code = $1",
                &[&code],
            )?
            .as_ref()
            .map(consignment_from_row)
            .transpose()
    }

    fn set_consignment_customer(
        &self,
        code: &str,
        customer_ref: Option<&str>,
    ) -> Result<bool, DbError> {
        Ok(self.exec.execute(
            "UPDATE consignments SET customer_ref = $2 WHERE code = $1",
            &[&code, &customer_ref],
        )? > 0)
    }

    fn insert_gate_pass(&self, pass: &GatePass) -> Result<(), DbError> {
        self.exec.execute(
            &format!(
                "INSERT INTO gate_passes ({GATE_PASS_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
            ),
            &[
                &pass.id,
                &pass.consignment_code,
                &pass.requested_quantity,
                &pass.approved_quantity,
                &pass.final_approved_quantity,
                &pass.gate,
                &pass.status.as_str(),
                &pass.payment_verified,
                &pass.payment_amount,
                &pass.total_picked_up,
                &pass.requested_by,
                &pass.approved_by,
                &pass.rejection_reason,
                &pass.issued_at,
                &pass.expires_at,
                &pass.approved_at,
                &pass.approval_expires_at,
                &pass.completed_at,
                &pass.updated_at,
            ],
        )?;
        Ok(())
    }

    fn gate_pass(&self, id: Uuid) -> Result<Option<GatePass>, DbError> {
        self.exec
            .query_opt(
                &format!("SELECT {GATE_PASS_COLUMNS} FROM gate_passes WHERE id = $1"),
                &[&id],
            )?
            .as_ref()
            .map(gate_pass_from_row)
            .transpose()
    }

    fn gate_pass_for_update(&self, id: Uuid) -> Result<Option<GatePass>, DbError> {
        self.exec
            .query_opt(
                &format!("SELECT {GATE_PASS_COLUMNS} FROM gate_passes WHERE id = $1 FOR UPDATE"),
                &[&id],
            )?
            .as_ref()
            .map(gate_pass_from_row)
            .transpose()
    }

    fn list_gate_passes(&self, filter: &GatePassFilter) -> Result<Vec<GatePass>, DbError> {
        let status = filter.status.map(GatePassStatus::as_str);
        let rows = self.exec.query_all(
            &format!(
                "SELECT {GATE_PASS_COLUMNS} FROM gate_passes \
                 WHERE ($1::TEXT IS NULL OR consignment_code = $1) \
                   AND ($2::TEXT IS NULL OR status = $2) \
                 ORDER BY issued_at DESC, id"
            ),
            &[&filter.consignment_code, &status],
        )?;
        map_rows(rows, gate_pass_from_row)
    }

    fn update_gate_pass(&self, pass: &GatePass, expected: GatePassStatus) -> Result<bool, DbError> {
        let updated = self.exec.execute(
            "UPDATE gate_passes SET approved_quantity = $3, final_approved_quantity = $4, gate = $5, \
             status = $6, payment_verified = $7, payment_amount = $8, total_picked_up = $9, \
             approved_by = $10, rejection_reason = $11, approved_at = $12, \
             approval_expires_at = $13, completed_at = $14, updated_at = $15 \
             WHERE id = $1 AND status = $2",
            &[
                &pass.id,
                &expected.as_str(),
                &pass.approved_quantity,
                &pass.final_approved_quantity,
                &pass.gate,
                &pass.status.as_str(),
                &pass.payment_verified,
                &pass.payment_amount,
                &pass.total_picked_up,
                &pass.approved_by,
                &pass.rejection_reason,
                &pass.approved_at,
                &pass.approval_expires_at,
                &pass.completed_at,
                &pass.updated_at,
            ],
        )?;
        Ok(updated > 0)
    }

    fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, DbError> {
        let rows = self.exec.query_all(
            "UPDATE gate_passes SET status = 'expired', updated_at = $1 \
             WHERE (status = 'pending' AND expires_at < $1) \
                OR (status = 'approved' AND approval_expires_at < $1) \
             RETURNING id",
            &[&now],
        )?;
        rows.iter().map(|row| col(row, "id")).collect()
    }

    fn insert_pickup(&self, pickup: &PickupRecord) -> Result<(), DbError> {
        self.exec.execute(
            &format!(
                "INSERT INTO gate_pass_pickups ({PICKUP_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ),
            &[
                &pickup.id,
                &pickup.gate_pass_id,
                &pickup.quantity,
                &pickup.room,
                &pickup.floor,
                &pickup.slot,
                &pickup.picked_at,
                &pickup.picked_by,
            ],
        )?;
        Ok(())
    }

    fn pickups_for(&self, gate_pass_id: Uuid) -> Result<Vec<PickupRecord>, DbError> {
        let rows = self.exec.query_all(
            &format!(
                "SELECT {PICKUP_COLUMNS} FROM gate_pass_pickups WHERE gate_pass_id = $1 \
                 ORDER BY picked_at, id"
            ),
            &[&gate_pass_id],
        )?;
        map_rows(rows, pickup_from_row)
    }

    fn picked_total(&self, gate_pass_id: Uuid) -> Result<i64, DbError> {
        let row = self.exec.query_one(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT AS total FROM gate_pass_pickups \
             WHERE gate_pass_id = $1",
            &[&gate_pass_id],
        )?;
        col(&row, "total")
    }
}
