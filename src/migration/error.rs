//! Migration-specific error types

use crate::executor::DbError;
use crate::transaction::TransactionError;

#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error
    Database(DbError),
    /// A migration's `up` or `down` failed
    ExecutionFailed {
        version: i64,
        name: String,
        error: String,
    },
    /// The state table lists a version this build does not know
    UnknownVersion { version: i64, name: String },
    /// Two built-in migrations share a version
    DuplicateVersion(i64),
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {e}"),
            MigrationError::ExecutionFailed {
                version,
                name,
                error,
            } => write!(
                f,
                "Migration '{name}' (version {version}) failed during execution: {error}"
            ),
            MigrationError::UnknownVersion { version, name } => write!(
                f,
                "Applied migration '{name}' (version {version}) is not known to this build"
            ),
            MigrationError::DuplicateVersion(version) => {
                write!(f, "Migration version {version} is registered twice")
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for MigrationError {
    fn from(error: DbError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<TransactionError> for MigrationError {
    fn from(error: TransactionError) -> Self {
        MigrationError::Database(error.into())
    }
}
