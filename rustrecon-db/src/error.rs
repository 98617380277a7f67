use rusqlite::ErrorCode;
use rustrecon_types::QueueStatus;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("queue item {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: QueueStatus,
        to: QueueStatus,
    },
    #[error("database still busy after {attempts} attempts")]
    Busy { attempts: u32 },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("{0}")]
    Other(String),
}

impl DbError {
    /// Lock contention that is worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// A UNIQUE or other constraint rejected the write.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
        )
    }
}
