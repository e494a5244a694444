use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// SQLite reported the database busy or locked. Worth retrying.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Errors that may succeed on a later attempt without any change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Errors a projection can skip: the row it meant to touch is already in
    /// (or already out of) the state the event describes.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Conflict(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Busy(_) => "busy",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Serialization(_) => "serialization",
            Self::CorruptRow { .. } => "corrupt_row",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy(e.to_string()),
                ErrorCode::ConstraintViolation => StoreError::Conflict(e.to_string()),
                _ => StoreError::Database(e.to_string()),
            },
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: ErrorCode) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code,
                extended_code: 0,
            },
            Some("simulated".into()),
        )
    }

    #[test]
    fn busy_and_locked_are_transient() {
        let busy: StoreError = sqlite_failure(ErrorCode::DatabaseBusy).into();
        let locked: StoreError = sqlite_failure(ErrorCode::DatabaseLocked).into();
        assert!(busy.is_transient());
        assert!(locked.is_transient());
        assert_eq!(busy.error_kind(), "busy");
    }

    #[test]
    fn constraint_violation_is_conflict() {
        let err: StoreError = sqlite_failure(ErrorCode::ConstraintViolation).into();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(err.is_skippable());
        assert!(!err.is_transient());
    }

    #[test]
    fn other_sqlite_errors_are_database() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!err.is_skippable());
        assert!(!err.is_transient());
    }

    #[test]
    fn serde_error_converts() {
        let serde_err = serde_json::from_str::<String>("nope").unwrap_err();
        let err: StoreError = serde_err.into();
        assert_eq!(err.error_kind(), "serialization");
    }

    #[test]
    fn corrupt_row_display() {
        let err = StoreError::CorruptRow {
            table: "events",
            column: "data",
            detail: "invalid JSON".into(),
        };
        assert_eq!(err.to_string(), "corrupt row in events.data: invalid JSON");
    }
}
