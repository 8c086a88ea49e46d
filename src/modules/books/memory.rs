//! In-process backend.
//!
//! All tables live behind one mutex. A [`MemoryScope`] stages its writes and
//! applies them under that mutex at commit, after re-checking every
//! conditional write against the committed state: the first scope to commit
//! wins and later ones fail with `DbError::Conflict`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use libris_db::{DbError, TxCoordinator};

use super::models::{
    contains_ignore_case, Book, BookFilter, BookId, BorrowingRecord, LoanFilter, LoanView,
    RecordId, SortOrder,
};
use super::store::{BookStore, BorrowingLedger};

#[derive(Debug, Default)]
struct Tables {
    books: HashMap<BookId, Book>,
    records: HashMap<RecordId, BorrowingRecord>,
}

impl Tables {
    fn check(&self, write: &Staged) -> Result<(), DbError> {
        match write {
            Staged::InsertRecord(record) => {
                if self.records.contains_key(&record.id) {
                    return Err(DbError::Duplicate(format!("borrowing record {}", record.id)));
                }
            }
            Staged::ReturnRecord { id, .. } => match self.records.get(id) {
                Some(record) if record.returned_at.is_none() => {}
                _ => return Err(DbError::conflict(format!("borrowing record {id} is not open"))),
            },
            Staged::UpdateBook { base_version, book } => match self.books.get(&book.id) {
                Some(stored) if stored.version == *base_version => {}
                _ => return Err(stale_book(book.id)),
            },
        }
        Ok(())
    }

    fn apply(&mut self, write: Staged) {
        match write {
            Staged::InsertRecord(record) => {
                self.records.insert(record.id, record);
            }
            Staged::ReturnRecord { id, returned_at } => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.returned_at = Some(returned_at);
                }
            }
            Staged::UpdateBook { book, .. } => {
                self.books.insert(book.id, book);
            }
        }
    }
}

#[derive(Debug)]
enum Staged {
    InsertRecord(BorrowingRecord),
    ReturnRecord {
        id: RecordId,
        returned_at: OffsetDateTime,
    },
    UpdateBook {
        /// Committed version the first staged update of this book was based on.
        base_version: i32,
        book: Book,
    },
}

fn stale_book(id: BookId) -> DbError {
    DbError::conflict(format!("book {id} was modified by another actor"))
}

/// Shared handle to one in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn book_store(&self) -> MemoryBookStore {
        MemoryBookStore { db: self.clone() }
    }

    pub fn ledger(&self) -> MemoryLedger {
        MemoryLedger { db: self.clone() }
    }

    pub fn coordinator(&self) -> MemoryTxCoordinator {
        MemoryTxCoordinator { db: self.clone() }
    }

    /// Drop a book row outright, bypassing the loan check.
    #[cfg(test)]
    pub(crate) fn remove_book(&self, id: BookId) {
        self.tables.lock().books.remove(&id);
    }
}

/// An open unit of work over a [`MemoryDb`]. Dropping it discards its writes.
#[derive(Debug)]
pub struct MemoryScope {
    staged: Vec<Staged>,
    open: bool,
}

impl MemoryScope {
    fn ensure_open(&self) -> Result<(), DbError> {
        if self.open {
            Ok(())
        } else {
            Err(DbError::Closed)
        }
    }

    fn staged_book(&self, id: BookId) -> Option<&Staged> {
        self.staged
            .iter()
            .rev()
            .find(|write| matches!(write, Staged::UpdateBook { book, .. } if book.id == id))
    }

    fn staged_record(&self, id: RecordId) -> Option<&BorrowingRecord> {
        self.staged.iter().rev().find_map(|write| match write {
            Staged::InsertRecord(record) if record.id == id => Some(record),
            _ => None,
        })
    }

    fn staged_return(&self, id: RecordId) -> bool {
        self.staged
            .iter()
            .any(|write| matches!(write, Staged::ReturnRecord { id: staged, .. } if *staged == id))
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn finish(&mut self) -> Vec<Staged> {
        self.open = false;
        std::mem::take(&mut self.staged)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTxCoordinator {
    db: MemoryDb,
}

#[async_trait]
impl TxCoordinator for MemoryTxCoordinator {
    type Scope = MemoryScope;

    async fn begin(&self) -> Result<MemoryScope, DbError> {
        Ok(MemoryScope {
            staged: Vec::new(),
            open: true,
        })
    }

    async fn commit(&self, scope: &mut MemoryScope) -> Result<(), DbError> {
        scope.ensure_open()?;
        let writes = scope.finish();

        let mut tables = self.db.tables.lock();
        for write in &writes {
            tables.check(write)?;
        }
        for write in writes {
            tables.apply(write);
        }
        Ok(())
    }

    async fn rollback(&self, scope: &mut MemoryScope) {
        scope.finish();
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBookStore {
    db: MemoryDb,
}

impl MemoryBookStore {
    fn bumped(stored: &Book, update: &Book) -> Book {
        Book {
            created_at: stored.created_at,
            added_by: stored.added_by,
            updated_at: OffsetDateTime::now_utc(),
            version: stored.version + 1,
            ..update.clone()
        }
    }
}

#[async_trait]
impl BookStore for MemoryBookStore {
    type Scope = MemoryScope;

    async fn get_by_id(&self, id: BookId) -> Result<Option<Book>, DbError> {
        Ok(self.db.tables.lock().books.get(&id).cloned())
    }

    async fn get_by_id_in(
        &self,
        scope: &mut MemoryScope,
        id: BookId,
    ) -> Result<Option<Book>, DbError> {
        scope.ensure_open()?;
        if let Some(Staged::UpdateBook { book, .. }) = scope.staged_book(id) {
            return Ok(Some(book.clone()));
        }
        self.get_by_id(id).await
    }

    async fn get_by_isbn(&self, isbn: &str) -> Result<Option<Book>, DbError> {
        let tables = self.db.tables.lock();
        Ok(tables
            .books
            .values()
            .filter(|book| book.isbn.as_deref() == Some(isbn))
            .min_by_key(|book| (book.created_at, book.id))
            .cloned())
    }

    async fn add(&self, book: &Book) -> Result<(), DbError> {
        let mut tables = self.db.tables.lock();
        if tables.books.contains_key(&book.id) {
            return Err(DbError::Duplicate(format!("book {}", book.id)));
        }
        tables.books.insert(book.id, book.clone());
        Ok(())
    }

    async fn update_with_version(
        &self,
        scope: Option<&mut MemoryScope>,
        book: &Book,
    ) -> Result<Book, DbError> {
        match scope {
            None => {
                let mut tables = self.db.tables.lock();
                let stored = tables
                    .books
                    .get(&book.id)
                    .filter(|stored| stored.version == book.version)
                    .ok_or_else(|| stale_book(book.id))?;
                let updated = Self::bumped(stored, book);
                tables.books.insert(updated.id, updated.clone());
                Ok(updated)
            }
            Some(scope) => {
                scope.ensure_open()?;
                let (visible, base_version) = match scope.staged_book(book.id) {
                    Some(Staged::UpdateBook { base_version, book }) => {
                        (book.clone(), *base_version)
                    }
                    _ => {
                        let stored = self
                            .get_by_id(book.id)
                            .await?
                            .ok_or_else(|| stale_book(book.id))?;
                        let version = stored.version;
                        (stored, version)
                    }
                };
                if visible.version != book.version {
                    return Err(stale_book(book.id));
                }
                let updated = Self::bumped(&visible, book);
                scope.staged.push(Staged::UpdateBook {
                    base_version,
                    book: updated.clone(),
                });
                Ok(updated)
            }
        }
    }

    async fn delete_with_version(&self, id: BookId, version: i32) -> Result<(), DbError> {
        let mut tables = self.db.tables.lock();
        let on_loan = tables
            .records
            .values()
            .any(|record| record.book_id == id && record.is_open());
        match tables.books.get(&id) {
            Some(stored) if stored.version == version && !on_loan => {
                tables.books.remove(&id);
                Ok(())
            }
            _ => Err(DbError::conflict(format!(
                "book {id} changed or went on loan before it could be deleted"
            ))),
        }
    }

    async fn list(&self, filter: &BookFilter) -> Result<Vec<Book>, DbError> {
        let tables = self.db.tables.lock();
        let mut books: Vec<&Book> = tables
            .books
            .values()
            .filter(|book| {
                filter
                    .title
                    .as_deref()
                    .is_none_or(|title| contains_ignore_case(&book.title, title))
                    && filter
                        .author
                        .as_deref()
                        .is_none_or(|author| contains_ignore_case(&book.author, author))
                    && filter
                        .category_id
                        .is_none_or(|category| book.category_id == Some(category))
            })
            .collect();
        books.sort_by_key(|book| (book.created_at, book.id));

        Ok(books
            .into_iter()
            .skip(usize::try_from(filter.offset).unwrap_or(0))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLedger {
    db: MemoryDb,
}

#[async_trait]
impl BorrowingLedger for MemoryLedger {
    type Scope = MemoryScope;

    async fn create(
        &self,
        scope: &mut MemoryScope,
        record: &BorrowingRecord,
    ) -> Result<(), DbError> {
        scope.ensure_open()?;
        if scope.staged_record(record.id).is_some()
            || self.db.tables.lock().records.contains_key(&record.id)
        {
            return Err(DbError::Duplicate(format!("borrowing record {}", record.id)));
        }
        scope.staged.push(Staged::InsertRecord(record.clone()));
        Ok(())
    }

    async fn get_by_id(&self, id: RecordId) -> Result<Option<BorrowingRecord>, DbError> {
        Ok(self.db.tables.lock().records.get(&id).cloned())
    }

    async fn update_return(
        &self,
        scope: &mut MemoryScope,
        record: &BorrowingRecord,
    ) -> Result<(), DbError> {
        scope.ensure_open()?;
        let still_open = self
            .get_by_id(record.id)
            .await?
            .is_some_and(|stored| stored.is_open());
        if !still_open || scope.staged_return(record.id) {
            return Err(DbError::conflict(format!(
                "borrowing record {} is not open",
                record.id
            )));
        }
        scope.staged.push(Staged::ReturnRecord {
            id: record.id,
            returned_at: record.returned_at.unwrap_or_else(OffsetDateTime::now_utc),
        });
        Ok(())
    }

    async fn list_by_book(&self, book_id: BookId) -> Result<Vec<BorrowingRecord>, DbError> {
        let tables = self.db.tables.lock();
        let mut records: Vec<BorrowingRecord> = tables
            .records
            .values()
            .filter(|record| record.book_id == book_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.borrowed_at, record.id));
        Ok(records)
    }

    async fn list_for_borrower(&self, filter: &LoanFilter) -> Result<Vec<LoanView>, DbError> {
        let tables = self.db.tables.lock();
        let mut loans: Vec<LoanView> = tables
            .records
            .values()
            .filter_map(|record| {
                let book = tables.books.get(&record.book_id);
                filter
                    .matches(record, book.map(|book| book.title.as_str()))
                    .then(|| {
                        LoanView::new(
                            record.clone(),
                            book.map(|book| book.title.clone()),
                            book.map(|book| book.author.clone()),
                        )
                    })
            })
            .collect();

        loans.sort_by_key(|loan| (loan.record.borrowed_at, loan.record.id));
        if filter.order == SortOrder::Desc {
            loans.reverse();
        }
        Ok(loans)
    }

    async fn count_open_for_book(&self, book_id: BookId) -> Result<u64, DbError> {
        let tables = self.db.tables.lock();
        let open = tables
            .records
            .values()
            .filter(|record| record.book_id == book_id && record.is_open())
            .count();
        Ok(open as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::books::models::UserId;

    fn book(stock: i32) -> Book {
        let now = OffsetDateTime::now_utc();
        Book {
            id: BookId::new(),
            title: "The Pragmatic Programmer".into(),
            author: "Andrew Hunt".into(),
            isbn: Some("9780201616224".into()),
            published_date: None,
            category_id: None,
            stock,
            added_by: UserId::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn scope_sees_its_own_writes_until_commit() {
        let db = MemoryDb::new();
        let (books, tx) = (db.book_store(), db.coordinator());
        let mut stored = book(2);
        books.add(&stored).await.unwrap();

        let mut scope = tx.begin().await.unwrap();
        stored.stock = 1;
        let updated = books
            .update_with_version(Some(&mut scope), &stored)
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let inside = books.get_by_id_in(&mut scope, stored.id).await.unwrap().unwrap();
        assert_eq!(inside.stock, 1);
        let outside = books.get_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(outside.stock, 2);

        tx.commit(&mut scope).await.unwrap();
        let committed = books.get_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!((committed.stock, committed.version), (1, 1));
    }

    #[tokio::test]
    async fn dropped_scope_discards_staged_writes() {
        let db = MemoryDb::new();
        let (books, ledger, tx) = (db.book_store(), db.ledger(), db.coordinator());
        let stored = book(1);
        books.add(&stored).await.unwrap();

        {
            let mut scope = tx.begin().await.unwrap();
            let record = BorrowingRecord::open(stored.id, UserId::new(), None);
            ledger.create(&mut scope, &record).await.unwrap();
            let mut taken = stored.clone();
            taken.stock = 0;
            books
                .update_with_version(Some(&mut scope), &taken)
                .await
                .unwrap();
        }

        assert_eq!(books.get_by_id(stored.id).await.unwrap().unwrap().stock, 1);
        assert_eq!(ledger.count_open_for_book(stored.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_committer_wins() {
        let db = MemoryDb::new();
        let (books, tx) = (db.book_store(), db.coordinator());
        let stored = book(1);
        books.add(&stored).await.unwrap();

        let mut first = tx.begin().await.unwrap();
        let mut second = tx.begin().await.unwrap();
        let mut taken = stored.clone();
        taken.stock = 0;
        books
            .update_with_version(Some(&mut first), &taken)
            .await
            .unwrap();
        books
            .update_with_version(Some(&mut second), &taken)
            .await
            .unwrap();

        tx.commit(&mut first).await.unwrap();
        let err = tx.commit(&mut second).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!second.is_open());
        assert_eq!(books.get_by_id(stored.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_unscoped_update_is_rejected() {
        let db = MemoryDb::new();
        let books = db.book_store();
        let mut stored = book(3);
        books.add(&stored).await.unwrap();

        stored.title = "Renamed".into();
        books.update_with_version(None, &stored).await.unwrap();

        stored.title = "Renamed again".into();
        let err = books.update_with_version(None, &stored).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            books.get_by_id(stored.id).await.unwrap().unwrap().title,
            "Renamed"
        );
    }

    #[tokio::test]
    async fn returning_twice_in_one_scope_conflicts() {
        let db = MemoryDb::new();
        let (ledger, tx) = (db.ledger(), db.coordinator());
        let mut record = BorrowingRecord::open(BookId::new(), UserId::new(), None);

        let mut scope = tx.begin().await.unwrap();
        ledger.create(&mut scope, &record).await.unwrap();
        tx.commit(&mut scope).await.unwrap();

        let mut scope = tx.begin().await.unwrap();
        record.returned_at = Some(OffsetDateTime::now_utc());
        ledger.update_return(&mut scope, &record).await.unwrap();
        let err = ledger.update_return(&mut scope, &record).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn finished_scope_is_closed() {
        let db = MemoryDb::new();
        let (books, tx) = (db.book_store(), db.coordinator());

        let mut scope = tx.begin().await.unwrap();
        tx.commit(&mut scope).await.unwrap();
        tx.rollback(&mut scope).await;

        assert!(matches!(
            books.get_by_id_in(&mut scope, BookId::new()).await,
            Err(DbError::Closed)
        ));
        assert!(matches!(tx.commit(&mut scope).await, Err(DbError::Closed)));
    }
}
