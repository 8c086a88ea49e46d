use thiserror::Error;

/// Failures raised by storage implementations and the transaction coordinator.
#[derive(Debug, Error)]
pub enum DbError {
    /// The backing store could not open a transaction.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// A conditional write matched zero rows.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A unique constraint rejected the write.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The scope was already committed or rolled back.
    #[error("transaction scope already finished")]
    Closed,

    #[error(transparent)]
    Query(sqlx::Error),
}

impl DbError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DbError::Duplicate(db_err.message().to_string());
            }
        }
        DbError::Query(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_stay_query_errors() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Query(sqlx::Error::RowNotFound)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn conflict_helper_builds_conflict() {
        let err = DbError::conflict("book was modified by another actor");
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "conflict: book was modified by another actor"
        );
    }
}
