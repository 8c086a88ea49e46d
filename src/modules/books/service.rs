//! The inventory service: catalogue maintenance and the borrow/return
//! transactions that keep stock and the ledger consistent.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;

use libris_db::{DbError, TxCoordinator};

use crate::utils::{normalize_isbn, page_window};

use super::category::CategoryLookup;
use super::error::InventoryError;
use super::models::{
    Book, BookFilter, BookId, BookQuery, BookUpdate, BookView, BorrowingRecord, CategoryId,
    LoanFilter, LoanView, NewBook, RecordId, UserId,
};
use super::store::{BookStore, BorrowingLedger};

/// Operations the HTTP layer drives. Object safe so handlers can share one
/// `Arc<dyn Inventory>` regardless of the storage backend behind it.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn add_book(&self, new: NewBook, added_by: UserId) -> Result<Book, InventoryError>;

    async fn get_book(&self, id: BookId) -> Result<BookView, InventoryError>;

    async fn update_book(&self, id: BookId, update: BookUpdate) -> Result<Book, InventoryError>;

    async fn delete_book(&self, id: BookId) -> Result<(), InventoryError>;

    async fn list_books(&self, query: BookQuery) -> Result<Vec<BookView>, InventoryError>;

    async fn borrow(
        &self,
        book_id: BookId,
        borrower: UserId,
        due_date: Option<OffsetDateTime>,
    ) -> Result<BorrowingRecord, InventoryError>;

    /// Close a loan. With `book_id` set, a record belonging to another book is
    /// reported as not found.
    async fn return_loan(
        &self,
        record_id: RecordId,
        book_id: Option<BookId>,
    ) -> Result<BorrowingRecord, InventoryError>;

    async fn list_loans(&self, filter: LoanFilter) -> Result<Vec<LoanView>, InventoryError>;

    async fn loans_for_book(&self, book_id: BookId)
        -> Result<Vec<BorrowingRecord>, InventoryError>;
}

pub struct InventoryService<B, L, T, C> {
    books: B,
    ledger: L,
    tx: T,
    categories: C,
    page_size: u32,
}

fn required(field: &str, value: &str) -> Result<String, InventoryError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(InventoryError::invalid(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn non_negative_stock(stock: i32) -> Result<i32, InventoryError> {
    if stock < 0 {
        return Err(InventoryError::invalid("stock cannot be negative"));
    }
    Ok(stock)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl<B, L, T, C> InventoryService<B, L, T, C>
where
    T: TxCoordinator,
    B: BookStore<Scope = T::Scope>,
    L: BorrowingLedger<Scope = T::Scope>,
    C: CategoryLookup,
{
    pub fn new(books: B, ledger: L, tx: T, categories: C) -> Self {
        Self {
            books,
            ledger,
            tx,
            categories,
            page_size: 10,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn ensure_isbn_free(
        &self,
        isbn: Option<&str>,
        except: Option<BookId>,
    ) -> Result<(), InventoryError> {
        let Some(isbn) = isbn else {
            return Ok(());
        };
        match self.books.get_by_isbn(isbn).await? {
            Some(existing) if Some(existing.id) != except => {
                tracing::warn!(%isbn, existing = %existing.id, "isbn already catalogued");
                Err(InventoryError::DuplicateBook {
                    isbn: isbn.to_string(),
                    title: existing.title,
                })
            }
            _ => Ok(()),
        }
    }

    async fn ensure_category(&self, id: Option<CategoryId>) -> Result<(), InventoryError> {
        let Some(id) = id else {
            return Ok(());
        };
        match self.categories.get_by_id(id).await? {
            Some(_) => Ok(()),
            None => Err(InventoryError::CategoryNotFound(id)),
        }
    }

    async fn borrow_in(
        &self,
        scope: &mut T::Scope,
        book_id: BookId,
        borrower: UserId,
        due_date: Option<OffsetDateTime>,
    ) -> Result<BorrowingRecord, InventoryError> {
        // The in-transaction read decides availability; the earlier one only
        // saves a transaction on the obvious miss.
        let mut book = self
            .books
            .get_by_id_in(scope, book_id)
            .await?
            .ok_or(InventoryError::BookNotFound(book_id))?;
        if !book.is_available() {
            return Err(InventoryError::BookUnavailable(book_id));
        }

        let record = BorrowingRecord::open(book_id, borrower, due_date);
        self.ledger.create(scope, &record).await?;

        book.stock -= 1;
        self.books.update_with_version(Some(&mut *scope), &book).await?;

        self.tx.commit(scope).await?;
        Ok(record)
    }

    async fn return_in(
        &self,
        scope: &mut T::Scope,
        mut record: BorrowingRecord,
        mut book: Book,
    ) -> Result<BorrowingRecord, InventoryError> {
        let record_id = record.id;
        record.returned_at = Some(OffsetDateTime::now_utc());
        self.ledger
            .update_return(scope, &record)
            .await
            .map_err(|err| match err {
                DbError::Conflict(_) => InventoryError::LoanAlreadyReturned(record_id),
                other => other.into(),
            })?;

        book.stock = book
            .stock
            .checked_add(1)
            .ok_or_else(|| InventoryError::invalid("stock is already at its maximum"))?;
        self.books.update_with_version(Some(&mut *scope), &book).await?;

        self.tx.commit(scope).await?;
        Ok(record)
    }
}

#[async_trait]
impl<B, L, T, C> Inventory for InventoryService<B, L, T, C>
where
    T: TxCoordinator,
    B: BookStore<Scope = T::Scope>,
    L: BorrowingLedger<Scope = T::Scope>,
    C: CategoryLookup,
{
    async fn add_book(&self, new: NewBook, added_by: UserId) -> Result<Book, InventoryError> {
        let title = required("title", &new.title)?;
        let author = required("author", &new.author)?;
        let stock = non_negative_stock(new.stock)?;
        let isbn = normalize_isbn(new.isbn.as_deref());

        self.ensure_isbn_free(isbn.as_deref(), None).await?;
        self.ensure_category(new.category_id).await?;

        let now = OffsetDateTime::now_utc();
        let book = Book {
            id: new.id.unwrap_or_default(),
            title,
            author,
            isbn,
            published_date: new.published_date,
            category_id: new.category_id,
            stock,
            added_by,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.books.add(&book).await.map_err(|err| match err {
            DbError::Duplicate(_) => InventoryError::DuplicateId(book.id),
            other => other.into(),
        })?;

        tracing::info!(book_id = %book.id, %added_by, stock = book.stock, "book added");
        Ok(book)
    }

    async fn get_book(&self, id: BookId) -> Result<BookView, InventoryError> {
        let book = self
            .books
            .get_by_id(id)
            .await?
            .ok_or(InventoryError::BookNotFound(id))?;

        let category = match book.category_id {
            Some(category_id) => self.categories.get_by_id(category_id).await?,
            None => None,
        };
        Ok(BookView::new(book, category.as_ref().map(|c| c.name.as_str())))
    }

    async fn update_book(&self, id: BookId, update: BookUpdate) -> Result<Book, InventoryError> {
        let title = required("title", &update.title)?;
        let author = required("author", &update.author)?;
        let stock = non_negative_stock(update.stock)?;
        let isbn = normalize_isbn(update.isbn.as_deref());

        let current = self
            .books
            .get_by_id(id)
            .await?
            .ok_or(InventoryError::BookNotFound(id))?;

        self.ensure_isbn_free(isbn.as_deref(), Some(id)).await?;
        self.ensure_category(update.category_id).await?;

        let candidate = Book {
            title,
            author,
            isbn,
            published_date: update.published_date,
            category_id: update.category_id,
            stock,
            version: update.version,
            ..current
        };

        match self.books.update_with_version(None, &candidate).await {
            Ok(updated) => {
                tracing::info!(book_id = %id, version = updated.version, "book updated");
                Ok(updated)
            }
            Err(err) if err.is_conflict() => {
                tracing::warn!(book_id = %id, version = update.version, "stale book update rejected");
                Err(InventoryError::OptimisticConflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_book(&self, id: BookId) -> Result<(), InventoryError> {
        let Some(book) = self.books.get_by_id(id).await? else {
            return Ok(());
        };

        let open = self.ledger.count_open_for_book(id).await?;
        if open > 0 {
            tracing::warn!(book_id = %id, open, "delete rejected: copies on loan");
            return Err(InventoryError::BookHasOpenLoans(id));
        }

        // A borrow committed after the count bumps the version, so the
        // conditional delete below matches nothing.
        match self.books.delete_with_version(id, book.version).await {
            Ok(()) => {
                tracing::info!(book_id = %id, "book deleted");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                if self.ledger.count_open_for_book(id).await? > 0 {
                    tracing::warn!(book_id = %id, "delete rejected: borrowed concurrently");
                    return Err(InventoryError::BookHasOpenLoans(id));
                }
                if self.books.get_by_id(id).await?.is_none() {
                    return Ok(());
                }
                tracing::warn!(book_id = %id, version = book.version, "stale book delete rejected");
                Err(InventoryError::OptimisticConflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_books(&self, query: BookQuery) -> Result<Vec<BookView>, InventoryError> {
        let (limit, offset) = page_window(query.page, self.page_size);
        let filter = BookFilter {
            title: non_blank(query.title),
            author: non_blank(query.author),
            category_id: query.category_id,
            limit,
            offset,
        };

        let (books, categories) = tokio::try_join!(
            async { self.books.list(&filter).await.map_err(InventoryError::from) },
            async {
                self.categories
                    .get_all()
                    .await
                    .map_err(InventoryError::from)
            },
        )?;

        let names: HashMap<CategoryId, String> = categories
            .into_iter()
            .map(|category| (category.id, category.name))
            .collect();

        Ok(books
            .into_iter()
            .map(|book| {
                let name = book
                    .category_id
                    .and_then(|id| names.get(&id))
                    .map(String::as_str);
                BookView::new(book, name)
            })
            .collect())
    }

    async fn borrow(
        &self,
        book_id: BookId,
        borrower: UserId,
        due_date: Option<OffsetDateTime>,
    ) -> Result<BorrowingRecord, InventoryError> {
        if due_date.is_some_and(|due| due <= OffsetDateTime::now_utc()) {
            return Err(InventoryError::invalid("due date must be in the future"));
        }

        let book = self
            .books
            .get_by_id(book_id)
            .await?
            .ok_or(InventoryError::BookNotFound(book_id))?;
        if !book.is_available() {
            tracing::warn!(%book_id, %borrower, "borrow rejected: no copies left");
            return Err(InventoryError::BookUnavailable(book_id));
        }

        let mut scope = self.tx.begin().await?;
        let outcome = self.borrow_in(&mut scope, book_id, borrower, due_date).await;
        self.tx.rollback(&mut scope).await;

        match &outcome {
            Ok(record) => {
                tracing::info!(%book_id, %borrower, record_id = %record.id, "book borrowed")
            }
            Err(err) => tracing::warn!(%book_id, %borrower, error = %err, "borrow failed"),
        }
        outcome
    }

    async fn return_loan(
        &self,
        record_id: RecordId,
        book_id: Option<BookId>,
    ) -> Result<BorrowingRecord, InventoryError> {
        let record = self
            .ledger
            .get_by_id(record_id)
            .await?
            .filter(|record| book_id.is_none_or(|book_id| book_id == record.book_id))
            .ok_or(InventoryError::RecordNotFound(record_id))?;
        if !record.is_open() {
            tracing::warn!(%record_id, "return rejected: loan already closed");
            return Err(InventoryError::LoanAlreadyReturned(record_id));
        }

        let book = match self.books.get_by_id(record.book_id).await? {
            Some(book) => book,
            None => {
                tracing::error!(
                    %record_id,
                    book_id = %record.book_id,
                    "open loan references a missing book"
                );
                return Err(InventoryError::BookNotFound(record.book_id));
            }
        };

        let mut scope = self.tx.begin().await?;
        let outcome = self.return_in(&mut scope, record, book).await;
        self.tx.rollback(&mut scope).await;

        match &outcome {
            Ok(record) => tracing::info!(%record_id, book_id = %record.book_id, "book returned"),
            Err(err) => tracing::warn!(%record_id, error = %err, "return failed"),
        }
        outcome
    }

    async fn list_loans(&self, filter: LoanFilter) -> Result<Vec<LoanView>, InventoryError> {
        let filter = LoanFilter {
            title: non_blank(filter.title),
            ..filter
        };
        Ok(self.ledger.list_for_borrower(&filter).await?)
    }

    async fn loans_for_book(
        &self,
        book_id: BookId,
    ) -> Result<Vec<BorrowingRecord>, InventoryError> {
        Ok(self.ledger.list_by_book(book_id).await?)
    }
}
