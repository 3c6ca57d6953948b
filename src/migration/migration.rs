//! Migration trait definition

use super::schema_manager::SchemaManager;
use crate::executor::DbError;

/// One versioned schema change.
///
/// Runs synchronously on a may coroutine like the rest of the crate.
pub trait Migration: Send + Sync {
    /// Human-readable identifier
    fn name(&self) -> &str;

    /// Version (timestamp: YYYYMMDDHHMMSS)
    fn version(&self) -> i64;

    /// Apply the migration
    ///
    /// # Errors
    ///
    /// Returns `DbError` if a statement fails.
    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbError>;

    /// Undo the migration
    ///
    /// # Errors
    ///
    /// Returns `DbError` if a statement fails.
    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), DbError>;
}
