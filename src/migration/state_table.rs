//! Migration state table management

use crate::executor::{DbError, StoreExecutor};
use sea_query::{ColumnDef, Table, TableCreateStatement};

pub const STATE_TABLE: &str = "coldstore_migrations";

/// `coldstore_migrations`: one row per applied version.
pub fn create_state_table() -> TableCreateStatement {
    Table::create()
        .table(STATE_TABLE)
        .if_not_exists()
        .col(
            ColumnDef::new("version")
                .big_integer()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new("name").string().string_len(255).not_null())
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new("execution_time_ms").big_integer().null())
        .to_owned()
}

/// Create the state table if it does not exist yet.
///
/// # Errors
///
/// Returns `DbError` if the DDL fails.
pub fn initialize_state_table(executor: &dyn StoreExecutor) -> Result<(), DbError> {
    let sql = create_state_table().build(sea_query::PostgresQueryBuilder);
    executor.execute(&sql, &[])?;
    Ok(())
}
