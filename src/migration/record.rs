//! `MigrationRecord` - rows of the `coldstore_migrations` state table

use crate::executor::DbError;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    /// `None` if not recorded
    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    /// Expected columns: `version`, `name`, `applied_at`, `execution_time_ms`
    ///
    /// # Errors
    ///
    /// Returns `DbError::ParseError` if a column is missing or has the wrong type.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let parse = |e: may_postgres::Error| DbError::ParseError(e.to_string());
        Ok(Self {
            version: row.try_get("version").map_err(parse)?,
            name: row.try_get("name").map_err(parse)?,
            applied_at: row.try_get("applied_at").map_err(parse)?,
            execution_time_ms: row.try_get("execution_time_ms").map_err(parse)?,
        })
    }
}
