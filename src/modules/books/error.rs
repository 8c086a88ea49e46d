use thiserror::Error;

use libris_db::DbError;
use libris_http::error::AppError;

use super::category::CategoryError;
use super::models::{BookId, CategoryId, RecordId};

/// Coarse classification callers (and the HTTP boundary) act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Unavailable,
    Upstream,
    Internal,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("book {0} not found")]
    BookNotFound(BookId),

    #[error("borrowing record {0} not found")]
    RecordNotFound(RecordId),

    #[error("category {0} not found")]
    CategoryNotFound(CategoryId),

    #[error("book already exists: {title}")]
    DuplicateBook { isbn: String, title: String },

    #[error("a book with id {0} already exists")]
    DuplicateId(BookId),

    #[error("book was modified by another request; reload and retry")]
    OptimisticConflict,

    #[error("borrowing record {0} was already returned")]
    LoanAlreadyReturned(RecordId),

    #[error("book {0} still has copies on loan")]
    BookHasOpenLoans(BookId),

    #[error("{0}")]
    InvalidInput(String),

    #[error("book {0} is currently unavailable")]
    BookUnavailable(BookId),

    #[error("category lookup failed")]
    Upstream(#[from] CategoryError),

    #[error("storage failure")]
    Storage(#[source] DbError),
}

impl InventoryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            InventoryError::BookNotFound(_)
            | InventoryError::RecordNotFound(_)
            | InventoryError::CategoryNotFound(_) => ErrorKind::NotFound,
            InventoryError::DuplicateBook { .. }
            | InventoryError::DuplicateId(_)
            | InventoryError::OptimisticConflict
            | InventoryError::LoanAlreadyReturned(_)
            | InventoryError::BookHasOpenLoans(_) => ErrorKind::Conflict,
            InventoryError::InvalidInput(_) => ErrorKind::InvalidInput,
            InventoryError::BookUnavailable(_) => ErrorKind::Unavailable,
            InventoryError::Upstream(_) => ErrorKind::Upstream,
            InventoryError::Storage(_) => ErrorKind::Internal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            InventoryError::BookNotFound(_) => "book_not_found",
            InventoryError::RecordNotFound(_) => "record_not_found",
            InventoryError::CategoryNotFound(_) => "category_not_found",
            InventoryError::DuplicateBook { .. } => "duplicate_book",
            InventoryError::DuplicateId(_) => "duplicate_id",
            InventoryError::OptimisticConflict => "optimistic_conflict",
            InventoryError::LoanAlreadyReturned(_) => "loan_already_returned",
            InventoryError::BookHasOpenLoans(_) => "book_has_open_loans",
            InventoryError::InvalidInput(_) => "validation_error",
            InventoryError::BookUnavailable(_) => "unavailable",
            InventoryError::Upstream(_) => "upstream_error",
            InventoryError::Storage(_) => "internal_error",
        }
    }
}

/// Zero-row conditional writes surface as optimistic conflicts; everything
/// else from storage is internal.
impl From<DbError> for InventoryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Conflict(_) => InventoryError::OptimisticConflict,
            other => InventoryError::Storage(other),
        }
    }
}

impl From<InventoryError> for AppError {
    fn from(err: InventoryError) -> Self {
        let code = err.code();
        match err.kind() {
            ErrorKind::NotFound => AppError::not_found(err.to_string()).with_code(code),
            ErrorKind::Conflict => AppError::conflict(vec![], err.to_string()).with_code(code),
            ErrorKind::InvalidInput => AppError::validation(vec![], err.to_string()),
            ErrorKind::Unavailable => AppError::unavailable(err.to_string()),
            ErrorKind::Upstream => AppError::upstream(err),
            ErrorKind::Internal => AppError::Internal(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn storage_conflicts_become_optimistic_conflicts() {
        let err: InventoryError = DbError::conflict("zero rows").into();
        assert!(matches!(err, InventoryError::OptimisticConflict));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: InventoryError = DbError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn kinds_map_to_http_statuses() {
        let cases = [
            (InventoryError::BookNotFound(BookId::new()), StatusCode::NOT_FOUND),
            (InventoryError::OptimisticConflict, StatusCode::CONFLICT),
            (InventoryError::invalid("title is required"), StatusCode::UNPROCESSABLE_ENTITY),
            (InventoryError::BookUnavailable(BookId::new()), StatusCode::CONFLICT),
            (
                InventoryError::Upstream(CategoryError::Status(503)),
                StatusCode::BAD_GATEWAY,
            ),
            (
                InventoryError::Storage(DbError::Unavailable("pool timed out".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn conflict_codes_are_specific() {
        let app: AppError = InventoryError::LoanAlreadyReturned(RecordId::new()).into();
        match app {
            AppError::Conflict { code, .. } => assert_eq!(code, "loan_already_returned"),
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
