//! SchemaManager - schema operations available to migrations

use crate::executor::{DbError, StoreExecutor};
use sea_query::{IndexCreateStatement, PostgresQueryBuilder, TableCreateStatement, TableDropStatement};

/// Builds sea-query DDL and runs it on the migration's executor.
pub struct SchemaManager<'a> {
    executor: &'a dyn StoreExecutor,
}

impl<'a> SchemaManager<'a> {
    pub fn new(executor: &'a dyn StoreExecutor) -> Self {
        Self { executor }
    }

    /// Create a table
    ///
    /// # Example
    /// ```rust,no_run
    /// use sea_query::{ColumnDef, Table};
    /// # fn run(manager: &coldstore::migration::SchemaManager<'_>) -> Result<(), coldstore::DbError> {
    /// let table = Table::create()
    ///     .table("consignments")
    ///     .if_not_exists()
    ///     .col(ColumnDef::new("code").text().not_null().primary_key())
    ///     .to_owned();
    /// manager.create_table(table)?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the statement fails.
    pub fn create_table(&self, table: TableCreateStatement) -> Result<(), DbError> {
        self.execute(&table.build(PostgresQueryBuilder))
    }

    /// # Errors
    ///
    /// Returns `DbError` if the statement fails.
    pub fn drop_table(&self, table: TableDropStatement) -> Result<(), DbError> {
        self.execute(&table.build(PostgresQueryBuilder))
    }

    /// # Errors
    ///
    /// Returns `DbError` if the statement fails.
    pub fn create_index(&self, index: IndexCreateStatement) -> Result<(), DbError> {
        self.execute(&index.build(PostgresQueryBuilder))
    }

    /// Execute raw DDL
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the statement fails.
    pub fn execute(&self, sql: &str) -> Result<(), DbError> {
        self.executor.execute(sql, &[]).map(|_| ())
    }

    pub fn executor(&self) -> &dyn StoreExecutor {
        self.executor
    }
}
