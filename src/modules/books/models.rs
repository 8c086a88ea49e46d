use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Label used for books whose category id has no match in the category service.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Fresh, time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(BookId);
uuid_id!(
    /// Identifier of a borrowing record (one loan).
    RecordId
);
uuid_id!(CategoryId);
uuid_id!(
    /// Subject id of a user as issued by the user service.
    UserId
);

/// A catalogued title and its physical stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    /// Digits only; hyphens are stripped on write.
    pub isbn: Option<String>,
    pub published_date: Option<Date>,
    pub category_id: Option<CategoryId>,
    /// Copies on the shelf. Never negative.
    pub stock: i32,
    pub added_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Bumped by every successful write; writers must present the version they read.
    pub version: i32,
}

impl Book {
    pub fn is_available(&self) -> bool {
        self.stock > 0
    }
}

/// Payload for adding a book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBook {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<BookId>,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub published_date: Option<Date>,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    #[serde(default)]
    pub stock: i32,
}

/// Full overwrite of a book's mutable fields, conditioned on `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub published_date: Option<Date>,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    pub stock: i32,
    /// The version the caller last read.
    pub version: i32,
}

/// Category as owned by the category service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
}

/// A book with its category resolved to a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookView {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub published_date: Option<Date>,
    pub category_id: Option<CategoryId>,
    pub category: String,
    pub stock: i32,
    pub version: i32,
}

impl BookView {
    pub fn new(book: Book, category: Option<&str>) -> Self {
        Self {
            id: book.id,
            title: book.title,
            author: book.author,
            isbn: book.isbn,
            published_date: book.published_date,
            category_id: book.category_id,
            category: category.unwrap_or(UNKNOWN_CATEGORY).to_string(),
            stock: book.stock,
            version: book.version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    /// Book is out; `returned_at` unset.
    Borrowed,
    /// Terminal.
    Returned,
}

impl FromStr for LoanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "borrowed" | "open" => Ok(LoanStatus::Borrowed),
            "returned" => Ok(LoanStatus::Returned),
            other => Err(format!("unknown loan status '{other}'")),
        }
    }
}

/// One loan in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowingRecord {
    pub id: RecordId,
    pub book_id: BookId,
    pub borrower_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub borrowed_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub returned_at: Option<OffsetDateTime>,
}

impl BorrowingRecord {
    /// A new open loan starting now.
    pub fn open(book_id: BookId, borrower_id: UserId, due_date: Option<OffsetDateTime>) -> Self {
        Self {
            id: RecordId::new(),
            book_id,
            borrower_id,
            borrowed_at: OffsetDateTime::now_utc(),
            due_date,
            returned_at: None,
        }
    }

    pub fn status(&self) -> LoanStatus {
        match self.returned_at {
            Some(_) => LoanStatus::Returned,
            None => LoanStatus::Borrowed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.returned_at.is_none()
    }

    /// Derived at read time; overdue is not a stored state.
    pub fn is_overdue(&self, now: OffsetDateTime) -> bool {
        self.is_open() && self.due_date.is_some_and(|due| due < now)
    }
}

/// A loan joined with the book it refers to, for the borrower's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanView {
    #[serde(flatten)]
    pub record: BorrowingRecord,
    pub status: LoanStatus,
    /// `None` when the book has since been deleted.
    pub title: Option<String>,
    pub author: Option<String>,
}

impl LoanView {
    pub fn new(record: BorrowingRecord, title: Option<String>, author: Option<String>) -> Self {
        Self {
            status: record.status(),
            record,
            title,
            author,
        }
    }
}

/// Page request for the catalogue listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookQuery {
    pub title: Option<String>,
    pub author: Option<String>,
    pub category_id: Option<CategoryId>,
    /// 1-based; zero is treated as the first page.
    pub page: u32,
}

/// Store-level listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookFilter {
    pub title: Option<String>,
    pub author: Option<String>,
    pub category_id: Option<CategoryId>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{other}'")),
        }
    }
}

/// A borrower's view over the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanFilter {
    pub borrower: UserId,
    /// Case-insensitive substring of the book title.
    pub title: Option<String>,
    pub status: Option<LoanStatus>,
    /// Applied to `borrowed_at`.
    pub order: SortOrder,
}

impl LoanFilter {
    pub fn for_borrower(borrower: UserId) -> Self {
        Self {
            borrower,
            title: None,
            status: None,
            order: SortOrder::default(),
        }
    }

    pub fn matches(&self, record: &BorrowingRecord, title: Option<&str>) -> bool {
        if record.borrower_id != self.borrower {
            return false;
        }
        if self.status.is_some_and(|status| status != record.status()) {
            return false;
        }
        match (&self.title, title) {
            (None, _) => true,
            (Some(needle), Some(title)) => contains_ignore_case(title, needle),
            (Some(_), None) => false,
        }
    }
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn ids_parse_and_display() {
        let id = BookId::new();
        let parsed: BookId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("nope".parse::<RecordId>().is_err());
    }

    #[test]
    fn loan_status_follows_returned_at() {
        let mut record = BorrowingRecord::open(BookId::new(), UserId::new(), None);
        assert_eq!(record.status(), LoanStatus::Borrowed);
        record.returned_at = Some(OffsetDateTime::now_utc());
        assert_eq!(record.status(), LoanStatus::Returned);
    }

    #[test]
    fn overdue_is_derived_from_due_date() {
        let mut record = BorrowingRecord::open(
            BookId::new(),
            UserId::new(),
            Some(datetime!(2024-01-10 12:00 UTC)),
        );
        assert!(record.is_overdue(datetime!(2024-01-11 00:00 UTC)));
        assert!(!record.is_overdue(datetime!(2024-01-09 00:00 UTC)));

        record.returned_at = Some(datetime!(2024-01-12 00:00 UTC));
        assert!(!record.is_overdue(datetime!(2024-02-01 00:00 UTC)));
    }

    #[test]
    fn missing_category_renders_unknown() {
        let now = OffsetDateTime::now_utc();
        let book = Book {
            id: BookId::new(),
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            isbn: None,
            published_date: None,
            category_id: Some(CategoryId::new()),
            stock: 1,
            added_by: UserId::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        assert_eq!(BookView::new(book.clone(), None).category, UNKNOWN_CATEGORY);
        assert_eq!(BookView::new(book, Some("Sci-Fi")).category, "Sci-Fi");
    }

    #[test]
    fn loan_filter_matches_title_and_status() {
        let borrower = UserId::new();
        let record = BorrowingRecord::open(BookId::new(), borrower, None);

        let mut filter = LoanFilter::for_borrower(borrower);
        filter.title = Some("rust".into());
        assert!(filter.matches(&record, Some("Programming RUST")));
        assert!(!filter.matches(&record, Some("Dune")));
        assert!(!filter.matches(&record, None));

        filter.title = None;
        filter.status = Some(LoanStatus::Returned);
        assert!(!filter.matches(&record, Some("Dune")));

        assert!(!LoanFilter::for_borrower(UserId::new()).matches(&record, None));
    }

    #[test]
    fn borrowing_record_serializes_rfc3339() {
        let record = BorrowingRecord {
            id: RecordId::new(),
            book_id: BookId::new(),
            borrower_id: UserId::new(),
            borrowed_at: datetime!(2024-03-01 09:30 UTC),
            due_date: None,
            returned_at: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["borrowed_at"], "2024-03-01T09:30:00Z");
        assert!(json["returned_at"].is_null());
    }
}
