//! Migrator - applies and rolls back the compiled-in migrations

use super::schema;
use crate::executor::{DbError, PgExecutor, StoreExecutor};
use crate::migration::{
    initialize_state_table, Migration, MigrationError, MigrationRecord, SchemaManager,
};
use crate::migration::state_table::STATE_TABLE;
use chrono::Utc;
use std::collections::HashSet;
use std::time::Instant;

/// Serializes concurrent migrators through `pg_advisory_xact_lock`.
const MIGRATION_LOCK_KEY: i64 = 0x636f_6c64_7374;

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    /// (version, name) of every known migration not yet applied, in order
    pub pending: Vec<(i64, String)>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn latest_applied_version(&self) -> Option<i64> {
        self.applied.iter().map(|m| m.version).max()
    }
}

pub struct Migrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrator {
    /// A migrator carrying the built-in schema.
    pub fn new() -> Self {
        Self {
            migrations: schema::builtin(),
        }
    }

    /// Register an additional migration after the built-in ones.
    pub fn with_migration(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version());
        self
    }

    fn check_versions(&self) -> Result<(), MigrationError> {
        let mut seen = HashSet::new();
        for migration in &self.migrations {
            if !seen.insert(migration.version()) {
                return Err(MigrationError::DuplicateVersion(migration.version()));
            }
        }
        Ok(())
    }

    /// Applied and pending migrations.
    ///
    /// # Errors
    ///
    /// `UnknownVersion` when the database has a version this migrator does not carry.
    pub fn status(&self, executor: &dyn StoreExecutor) -> Result<MigrationStatus, MigrationError> {
        self.check_versions()?;
        initialize_state_table(executor)?;
        let applied = Self::query_applied(executor)?;

        let known: HashSet<i64> = self.migrations.iter().map(|m| m.version()).collect();
        if let Some(stray) = applied.iter().find(|r| !known.contains(&r.version)) {
            return Err(MigrationError::UnknownVersion {
                version: stray.version,
                name: stray.name.clone(),
            });
        }

        let applied_versions: HashSet<i64> = applied.iter().map(|r| r.version).collect();
        let pending = self
            .migrations
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .map(|m| (m.version(), m.name().to_string()))
            .collect();
        Ok(MigrationStatus { applied, pending })
    }

    /// Apply every pending migration, each in its own transaction.
    ///
    /// # Errors
    ///
    /// Stops at the first failing migration; earlier ones stay applied.
    pub fn up(&self, executor: &PgExecutor) -> Result<usize, MigrationError> {
        let status = self.status(executor)?;
        let mut applied = 0;

        for (version, _) in &status.pending {
            let Some(migration) = self.migrations.iter().find(|m| m.version() == *version) else {
                continue;
            };

            let tx = executor.begin()?;
            tx.query_one("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])?;
            // Another migrator may have applied it while we waited for the lock.
            if Self::is_applied(&tx, *version)? {
                tx.commit()?;
                continue;
            }

            let start = Instant::now();
            migration
                .up(&SchemaManager::new(&tx))
                .map_err(|e| MigrationError::ExecutionFailed {
                    version: *version,
                    name: migration.name().to_string(),
                    error: e.to_string(),
                })?;
            let elapsed = i64::try_from(start.elapsed().as_millis()).ok();

            Self::record(
                &tx,
                &MigrationRecord {
                    version: *version,
                    name: migration.name().to_string(),
                    applied_at: Utc::now(),
                    execution_time_ms: elapsed,
                },
            )?;
            tx.commit()?;
            log::info!("applied migration {version} {}", migration.name());
            applied += 1;
        }
        Ok(applied)
    }

    /// Roll back the `steps` most recently applied migrations.
    ///
    /// # Errors
    ///
    /// Stops at the first failing rollback.
    pub fn down(&self, executor: &PgExecutor, steps: usize) -> Result<usize, MigrationError> {
        let mut status = self.status(executor)?;
        status.applied.sort_by_key(|r| std::cmp::Reverse(r.version));
        let mut rolled_back = 0;

        for record in status.applied.iter().take(steps) {
            let Some(migration) = self
                .migrations
                .iter()
                .find(|m| m.version() == record.version)
            else {
                continue;
            };

            let tx = executor.begin()?;
            tx.query_one("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])?;
            migration
                .down(&SchemaManager::new(&tx))
                .map_err(|e| MigrationError::ExecutionFailed {
                    version: record.version,
                    name: record.name.clone(),
                    error: e.to_string(),
                })?;
            tx.execute(
                &format!("DELETE FROM {STATE_TABLE} WHERE version = $1"),
                &[&record.version],
            )?;
            tx.commit()?;
            log::info!("rolled back migration {} {}", record.version, record.name);
            rolled_back += 1;
        }
        Ok(rolled_back)
    }

    fn query_applied(executor: &dyn StoreExecutor) -> Result<Vec<MigrationRecord>, DbError> {
        let rows = executor.query_all(
            &format!(
                "SELECT version, name, applied_at, execution_time_ms FROM {STATE_TABLE} ORDER BY version"
            ),
            &[],
        )?;
        rows.iter().map(MigrationRecord::from_row).collect()
    }

    fn is_applied(executor: &dyn StoreExecutor, version: i64) -> Result<bool, DbError> {
        Ok(executor
            .query_opt(
                &format!("SELECT 1 FROM {STATE_TABLE} WHERE version = $1"),
                &[&version],
            )?
            .is_some())
    }

    fn record(executor: &dyn StoreExecutor, record: &MigrationRecord) -> Result<(), DbError> {
        executor.execute(
            &format!(
                "INSERT INTO {STATE_TABLE} (version, name, applied_at, execution_time_ms) \
                 VALUES ($1, $2, $3, $4)"
            ),
            &[
                &record.version,
                &record.name,
                &record.applied_at,
                &record.execution_time_ms,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(i64);

    impl Migration for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn version(&self) -> i64 {
            self.0
        }

        fn up(&self, _manager: &SchemaManager<'_>) -> Result<(), DbError> {
            Ok(())
        }

        fn down(&self, _manager: &SchemaManager<'_>) -> Result<(), DbError> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_versions_are_rejected() {
        let migrator = Migrator::new().with_migration(Box::new(Noop(20240301000001)));
        assert!(matches!(
            migrator.check_versions(),
            Err(MigrationError::DuplicateVersion(20240301000001))
        ));
    }

    #[test]
    fn test_extra_migrations_sort_by_version() {
        let migrator = Migrator::new().with_migration(Box::new(Noop(20200101000000)));
        assert_eq!(migrator.migrations[0].version(), 20200101000000);
        assert!(migrator.check_versions().is_ok());
    }
}
