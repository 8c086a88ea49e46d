//! Postgres implementations of the book store and borrowing ledger.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use libris_db::{DbError, PgScope};

use super::models::{
    Book, BookFilter, BookId, BorrowingRecord, LoanFilter, LoanStatus, LoanView, RecordId,
    SortOrder,
};
use super::store::{BookStore, BorrowingLedger};

const BOOK_COLUMNS: &str = "id, title, author, isbn, published_date, category_id, stock, \
     added_by, created_at, updated_at, version";

const RECORD_COLUMNS: &str = "id, book_id, user_id, borrowed_at, due_date, returned_at";

#[derive(Debug, FromRow)]
struct BookRow {
    id: Uuid,
    title: String,
    author: String,
    isbn: Option<String>,
    published_date: Option<Date>,
    category_id: Option<Uuid>,
    stock: i32,
    added_by: Uuid,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    version: i32,
}

impl From<BookRow> for Book {
    fn from(row: BookRow) -> Self {
        Book {
            id: row.id.into(),
            title: row.title,
            author: row.author,
            isbn: row.isbn,
            published_date: row.published_date,
            category_id: row.category_id.map(Into::into),
            stock: row.stock,
            added_by: row.added_by.into(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        }
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    book_id: Uuid,
    user_id: Uuid,
    borrowed_at: OffsetDateTime,
    due_date: Option<OffsetDateTime>,
    returned_at: Option<OffsetDateTime>,
}

impl From<RecordRow> for BorrowingRecord {
    fn from(row: RecordRow) -> Self {
        BorrowingRecord {
            id: row.id.into(),
            book_id: row.book_id.into(),
            borrower_id: row.user_id.into(),
            borrowed_at: row.borrowed_at,
            due_date: row.due_date,
            returned_at: row.returned_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct LoanRow {
    #[sqlx(flatten)]
    record: RecordRow,
    title: Option<String>,
    author: Option<String>,
}

/// `%needle%` with LIKE metacharacters escaped.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[derive(Clone)]
pub struct PgBookStore {
    pool: PgPool,
}

impl PgBookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookStore for PgBookStore {
    type Scope = PgScope;

    async fn get_by_id(&self, id: BookId) -> Result<Option<Book>, DbError> {
        let row: Option<BookRow> =
            sqlx::query_as(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Book::from))
    }

    async fn get_by_id_in(&self, scope: &mut PgScope, id: BookId) -> Result<Option<Book>, DbError> {
        let row: Option<BookRow> =
            sqlx::query_as(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(scope.conn()?)
                .await?;
        Ok(row.map(Book::from))
    }

    async fn get_by_isbn(&self, isbn: &str) -> Result<Option<Book>, DbError> {
        let row: Option<BookRow> = sqlx::query_as(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE isbn = $1 ORDER BY created_at, id LIMIT 1"
        ))
        .bind(isbn)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Book::from))
    }

    async fn add(&self, book: &Book) -> Result<(), DbError> {
        sqlx::query(&format!(
            "INSERT INTO books ({BOOK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(book.id.0)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.isbn)
        .bind(book.published_date)
        .bind(book.category_id.map(|id| id.0))
        .bind(book.stock)
        .bind(book.added_by.0)
        .bind(book.created_at)
        .bind(book.updated_at)
        .bind(book.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_with_version(
        &self,
        scope: Option<&mut PgScope>,
        book: &Book,
    ) -> Result<Book, DbError> {
        let sql = format!(
            "UPDATE books SET title = $1, author = $2, isbn = $3, published_date = $4, \
             category_id = $5, stock = $6, updated_at = $7, version = version + 1 \
             WHERE id = $8 AND version = $9 \
             RETURNING {BOOK_COLUMNS}"
        );
        let query = sqlx::query_as::<_, BookRow>(&sql)
            .bind(&book.title)
            .bind(&book.author)
            .bind(&book.isbn)
            .bind(book.published_date)
            .bind(book.category_id.map(|id| id.0))
            .bind(book.stock)
            .bind(OffsetDateTime::now_utc())
            .bind(book.id.0)
            .bind(book.version);

        // No returned row means zero rows matched the version predicate.
        let row = match scope {
            Some(scope) => query.fetch_optional(scope.conn()?).await?,
            None => query.fetch_optional(&self.pool).await?,
        };

        row.map(Book::from).ok_or_else(|| {
            DbError::conflict(format!("book {} was modified by another actor", book.id))
        })
    }

    async fn delete_with_version(&self, id: BookId, version: i32) -> Result<(), DbError> {
        let result = sqlx::query(
            "DELETE FROM books WHERE id = $1 AND version = $2 \
             AND NOT EXISTS (SELECT 1 FROM borrowing_records \
                             WHERE book_id = $1 AND returned_at IS NULL)",
        )
        .bind(id.0)
        .bind(version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::conflict(format!(
                "book {id} changed or went on loan before it could be deleted"
            )));
        }
        Ok(())
    }

    async fn list(&self, filter: &BookFilter) -> Result<Vec<Book>, DbError> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE TRUE"
        ));
        if let Some(title) = &filter.title {
            query.push(" AND title ILIKE ").push_bind(like_pattern(title));
        }
        if let Some(author) = &filter.author {
            query.push(" AND author ILIKE ").push_bind(like_pattern(author));
        }
        if let Some(category) = filter.category_id {
            query.push(" AND category_id = ").push_bind(category.0);
        }
        query
            .push(" ORDER BY created_at, id LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows: Vec<BookRow> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Book::from).collect())
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BorrowingLedger for PgLedger {
    type Scope = PgScope;

    async fn create(&self, scope: &mut PgScope, record: &BorrowingRecord) -> Result<(), DbError> {
        sqlx::query(&format!(
            "INSERT INTO borrowing_records ({RECORD_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(record.id.0)
        .bind(record.book_id.0)
        .bind(record.borrower_id.0)
        .bind(record.borrowed_at)
        .bind(record.due_date)
        .bind(record.returned_at)
        .execute(scope.conn()?)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: RecordId) -> Result<Option<BorrowingRecord>, DbError> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM borrowing_records WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BorrowingRecord::from))
    }

    async fn update_return(
        &self,
        scope: &mut PgScope,
        record: &BorrowingRecord,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            "UPDATE borrowing_records SET returned_at = $2 \
             WHERE id = $1 AND returned_at IS NULL",
        )
        .bind(record.id.0)
        .bind(record.returned_at.unwrap_or_else(OffsetDateTime::now_utc))
        .execute(scope.conn()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::conflict(format!(
                "borrowing record {} is not open",
                record.id
            )));
        }
        Ok(())
    }

    async fn list_by_book(&self, book_id: BookId) -> Result<Vec<BorrowingRecord>, DbError> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM borrowing_records \
             WHERE book_id = $1 ORDER BY borrowed_at, id"
        ))
        .bind(book_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BorrowingRecord::from).collect())
    }

    async fn list_for_borrower(&self, filter: &LoanFilter) -> Result<Vec<LoanView>, DbError> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT r.id, r.book_id, r.user_id, r.borrowed_at, r.due_date, r.returned_at, \
             b.title, b.author \
             FROM borrowing_records r LEFT JOIN books b ON b.id = r.book_id \
             WHERE r.user_id = ",
        );
        query.push_bind(filter.borrower.0);

        if let Some(title) = &filter.title {
            query.push(" AND b.title ILIKE ").push_bind(like_pattern(title));
        }
        match filter.status {
            Some(LoanStatus::Borrowed) => {
                query.push(" AND r.returned_at IS NULL");
            }
            Some(LoanStatus::Returned) => {
                query.push(" AND r.returned_at IS NOT NULL");
            }
            None => {}
        }
        query.push(match filter.order {
            SortOrder::Asc => " ORDER BY r.borrowed_at ASC, r.id ASC",
            SortOrder::Desc => " ORDER BY r.borrowed_at DESC, r.id DESC",
        });

        let rows: Vec<LoanRow> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| LoanView::new(row.record.into(), row.title, row.author))
            .collect())
    }

    async fn count_open_for_book(&self, book_id: BookId) -> Result<u64, DbError> {
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM borrowing_records WHERE book_id = $1 AND returned_at IS NULL",
        )
        .bind(book_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(open).unwrap_or(0))
    }
}
