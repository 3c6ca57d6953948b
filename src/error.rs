//! Error taxonomy for ledger and gate-pass operations

use crate::executor::DbError;
use std::fmt;

#[derive(Debug)]
pub enum CoreError {
    /// Malformed request, rejected before the store is touched.
    Validation(String),
    /// Unknown gate pass, consignment or allocation.
    NotFound(String),
    /// Well-formed request the current state refuses: insufficient stock, wrong status.
    Conflict(String),
    /// The gate pass is past its issuance or pickup deadline.
    Expired(String),
    /// The backing store failed.
    Storage(DbError),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    /// `Expired` is a conflict variant.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict(_) | CoreError::Expired(_))
    }

    /// HTTP-equivalent status for transport wrappers.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) | CoreError::Expired(_) => 409,
            CoreError::Storage(_) => 500,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Validation(msg) => write!(f, "Validation error: {msg}"),
            CoreError::NotFound(msg) => write!(f, "Not found: {msg}"),
            CoreError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            CoreError::Expired(msg) => write!(f, "Expired: {msg}"),
            CoreError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        CoreError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_is_a_conflict() {
        assert!(CoreError::Expired("pickup window closed".into()).is_conflict());
        assert!(CoreError::conflict("insufficient stock").is_conflict());
        assert!(!CoreError::validation("quantity must be positive").is_conflict());
        assert!(!CoreError::not_found("gate pass").is_conflict());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CoreError::validation("x").status_code(), 400);
        assert_eq!(CoreError::not_found("x").status_code(), 404);
        assert_eq!(CoreError::conflict("x").status_code(), 409);
        assert_eq!(CoreError::Expired("x".into()).status_code(), 409);
        assert_eq!(CoreError::Storage(DbError::Other("x".into())).status_code(), 500);
    }

    #[test]
    fn test_storage_errors_keep_their_source() {
        use std::error::Error;
        let err: CoreError = DbError::QueryError("syntax".into()).into();
        assert!(err.source().is_some());
        assert!(err.to_string().contains("syntax"));
    }
}
