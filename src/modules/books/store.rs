//! Storage contracts the inventory service depends on.
//!
//! Each trait names only what the service needs. A backend supplies a book
//! store, a borrowing ledger and a [`TxCoordinator`](libris_db::TxCoordinator)
//! that share one scope type, so writes from both stores can land in the same
//! transaction.

use async_trait::async_trait;

use libris_db::DbError;

use super::models::{Book, BookFilter, BookId, BorrowingRecord, LoanFilter, LoanView, RecordId};

#[async_trait]
pub trait BookStore: Send + Sync {
    type Scope: Send;

    async fn get_by_id(&self, id: BookId) -> Result<Option<Book>, DbError>;

    /// Read through an open scope, seeing that scope's own uncommitted writes.
    async fn get_by_id_in(&self, scope: &mut Self::Scope, id: BookId)
        -> Result<Option<Book>, DbError>;

    async fn get_by_isbn(&self, isbn: &str) -> Result<Option<Book>, DbError>;

    /// Insert a new book. A taken id yields `DbError::Duplicate`.
    async fn add(&self, book: &Book) -> Result<(), DbError>;

    /// Overwrite the book's mutable fields if its stored version still equals
    /// `book.version`, returning the stored row with the bumped version.
    ///
    /// Zero rows matched yields `DbError::Conflict`. With `None` the write
    /// commits on its own.
    async fn update_with_version(
        &self,
        scope: Option<&mut Self::Scope>,
        book: &Book,
    ) -> Result<Book, DbError>;

    /// Remove the book if its stored version still equals `version` and no
    /// loan against it is open.
    ///
    /// Zero rows matched (stale version, an open loan, or the book already
    /// gone) yields `DbError::Conflict`.
    async fn delete_with_version(&self, id: BookId, version: i32) -> Result<(), DbError>;

    /// One page ordered by `(created_at, id)`.
    async fn list(&self, filter: &BookFilter) -> Result<Vec<Book>, DbError>;
}

#[async_trait]
pub trait BorrowingLedger: Send + Sync {
    type Scope: Send;

    async fn create(&self, scope: &mut Self::Scope, record: &BorrowingRecord)
        -> Result<(), DbError>;

    async fn get_by_id(&self, id: RecordId) -> Result<Option<BorrowingRecord>, DbError>;

    /// Stamp `record.returned_at` on a loan that is still open.
    ///
    /// An already returned (or missing) record yields `DbError::Conflict`.
    async fn update_return(
        &self,
        scope: &mut Self::Scope,
        record: &BorrowingRecord,
    ) -> Result<(), DbError>;

    /// Every record for one book, oldest first.
    async fn list_by_book(&self, book_id: BookId) -> Result<Vec<BorrowingRecord>, DbError>;

    async fn list_for_borrower(&self, filter: &LoanFilter) -> Result<Vec<LoanView>, DbError>;

    async fn count_open_for_book(&self, book_id: BookId) -> Result<u64, DbError>;
}
