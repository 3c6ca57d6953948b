//! Consignments and their category-scoped codes
//!
//! A consignment code is `"{sequence}/{expected_quantity}"`, where the sequence is the
//! category's starting offset plus the number of consignments already registered in that
//! category. Numbering is derived from row counts, not a counter table: deleting a
//! consignment lets a later registration reuse a sequence number.

use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Seed,
    Ration,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Seed, Category::Ration];

    /// First sequence number handed out in this category.
    pub fn offset(self) -> i64 {
        match self {
            Category::Seed => 1,
            Category::Ration => 10_001,
        }
    }

    /// Sequence numbers available before the category runs into the next range.
    pub fn range_size(self) -> i64 {
        9_999
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Seed => "seed",
            Category::Ration => "ration",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seed" => Ok(Category::Seed),
            "ration" => Ok(Category::Ration),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consignment {
    pub code: String,
    pub category: Category,
    pub expected_quantity: i64,
    pub customer_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Code for the next consignment in `category`.
///
/// # Errors
///
/// `Validation` when the quantity is not positive or the category range is exhausted.
pub fn next_code(
    category: Category,
    existing_in_category: i64,
    expected_quantity: i64,
) -> Result<String, CoreError> {
    if expected_quantity <= 0 {
        return Err(CoreError::validation("expected quantity must be positive"));
    }
    if existing_in_category < 0 || existing_in_category >= category.range_size() {
        return Err(CoreError::validation(format!(
            "{category} numbering range is exhausted ({existing_in_category} registered)"
        )));
    }
    let sequence = category.offset() + existing_in_category;
    Ok(format!("{sequence}/{expected_quantity}"))
}

/// Splits a code back into (sequence, expected quantity).
pub fn parse_code(code: &str) -> Option<(i64, i64)> {
    let (sequence, quantity) = code.split_once('/')?;
    Some((sequence.trim().parse().ok()?, quantity.trim().parse().ok()?))
}

/// Category a sequence number belongs to.
pub fn category_of(sequence: i64) -> Option<Category> {
    Category::ALL.into_iter().find(|c| {
        sequence >= c.offset() && sequence < c.offset() + c.range_size()
    })
}

pub struct ConsignmentRegistry<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl<S: Store> ConsignmentRegistry<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, clock, audit }
    }

    /// Number and insert a new consignment.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad quantity or exhausted range; `Storage` when two registrations
    /// race for the same sequence number and the second insert hits the primary key.
    pub fn register(
        &self,
        category: Category,
        expected_quantity: i64,
        customer_ref: Option<&str>,
        actor: &str,
    ) -> Result<Consignment, CoreError> {
        let now = self.clock.now();
        let consignment = self.store.atomically(|ops| {
            let existing = ops.count_consignments(category)?;
            let code = next_code(category, existing, expected_quantity)?;
            let consignment = Consignment {
                code,
                category,
                expected_quantity,
                customer_ref: customer_ref.map(str::to_string),
                created_at: now,
            };
            ops.insert_consignment(&consignment)?;
            Ok(consignment)
        })?;

        log::info!("registered consignment {} ({category})", consignment.code);
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::ConsignmentRegistered,
                format!(
                    "registered {category} consignment {} expecting {expected_quantity}",
                    consignment.code
                ),
                now,
            ),
        );
        Ok(consignment)
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown code.
    pub fn find(&self, code: &str) -> Result<Consignment, CoreError> {
        self.store
            .with_ops(|ops| Ok(ops.consignment(code)?))?
            .ok_or_else(|| CoreError::not_found(format!("consignment {code}")))
    }

    /// Administrative correction of the owning customer.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown code.
    pub fn relink_customer(
        &self,
        code: &str,
        customer_ref: Option<&str>,
        actor: &str,
    ) -> Result<(), CoreError> {
        let updated = self
            .store
            .with_ops(|ops| Ok(ops.set_consignment_customer(code, customer_ref)?))?;
        if !updated {
            return Err(CoreError::not_found(format!("consignment {code}")));
        }
        audit::emit(
            self.audit.as_ref(),
            AuditEntry::new(
                actor,
                AuditAction::CustomerRelinked,
                format!(
                    "linked consignment {code} to customer {}",
                    customer_ref.unwrap_or("<none>")
                ),
                self.clock.now(),
            ),
        );
        Ok(())
    }
}
