use dock_core::CoreError;
use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Domain(#[from] CoreError),
}

impl StoreError {
    /// The write lost a race for the database file and is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn test_busy_and_locked_are_transient() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_transient());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_transient());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_domain_error_is_transparent() {
        let err = StoreError::from(CoreError::InvalidShipment("no tags".into()));
        assert_eq!(err.to_string(), "invalid shipment: no tags");
    }
}
