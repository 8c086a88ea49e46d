//! Books module: the catalogue, stock and the borrowing ledger.

pub mod category;
pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod routes;
pub mod service;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::{routing::get, Router};
use once_cell::sync::OnceCell;

use libris_db::PgTxCoordinator;
use libris_kernel::{InitCtx, Migration, Module};

use category::{CategoryCache, HttpCategoryClient};
use memory::MemoryDb;
use postgres::{PgBookStore, PgLedger};
use service::{Inventory, InventoryService};

pub use error::{ErrorKind, InventoryError};

const CREATE_BOOKS: &str = r#"
    CREATE TABLE IF NOT EXISTS books (
        id             UUID        PRIMARY KEY,
        title          TEXT        NOT NULL,
        author         TEXT        NOT NULL,
        isbn           TEXT,
        published_date DATE,
        category_id    UUID,
        stock          INTEGER     NOT NULL CHECK (stock >= 0),
        added_by       UUID        NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        version        INTEGER     NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS books_isbn_idx ON books (isbn);
    CREATE INDEX IF NOT EXISTS books_created_at_idx ON books (created_at, id);
"#;

const CREATE_BORROWING_RECORDS: &str = r#"
    CREATE TABLE IF NOT EXISTS borrowing_records (
        id          UUID        PRIMARY KEY,
        book_id     UUID        NOT NULL,
        user_id     UUID        NOT NULL,
        borrowed_at TIMESTAMPTZ NOT NULL,
        due_date    TIMESTAMPTZ,
        returned_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS borrowing_records_book_idx ON borrowing_records (book_id);
    CREATE INDEX IF NOT EXISTS borrowing_records_user_idx ON borrowing_records (user_id);
"#;

pub struct BooksModule {
    inventory: OnceCell<Arc<dyn Inventory>>,
}

impl BooksModule {
    pub fn new() -> Self {
        Self {
            inventory: OnceCell::new(),
        }
    }
}

impl Default for BooksModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for BooksModule {
    fn name(&self) -> &'static str {
        "books"
    }

    async fn init(&self, ctx: &InitCtx<'_>) -> anyhow::Result<()> {
        let settings = ctx.settings;
        let client = HttpCategoryClient::new(&settings.categories)
            .context("failed to build category client")?;
        let categories = CategoryCache::new(
            client,
            Duration::from_secs(settings.categories.cache_ttl_secs),
        );
        let page_size = settings.books.page_size;

        let inventory: Arc<dyn Inventory> = match ctx.db {
            Some(pool) => Arc::new(
                InventoryService::new(
                    PgBookStore::new(pool.clone()),
                    PgLedger::new(pool.clone()),
                    PgTxCoordinator::new(pool.clone()),
                    categories,
                )
                .with_page_size(page_size),
            ),
            None => {
                let db = MemoryDb::new();
                Arc::new(
                    InventoryService::new(db.book_store(), db.ledger(), db.coordinator(), categories)
                        .with_page_size(page_size),
                )
            }
        };

        self.inventory
            .set(inventory)
            .map_err(|_| anyhow!("books module initialized twice"))?;

        tracing::info!(
            module = self.name(),
            storage = if ctx.db.is_some() { "postgres" } else { "memory" },
            category_service = %settings.categories.base_url,
            "books module initialized"
        );
        Ok(())
    }

    fn routes(&self) -> Router {
        match self.inventory.get() {
            Some(inventory) => routes::router(inventory.clone()),
            None => {
                tracing::warn!(module = self.name(), "routes requested before init");
                Router::new().route("/health", get(|| async { "books module is not initialized" }))
            }
        }
    }

    fn openapi(&self) -> Option<serde_json::Value> {
        Some(openapi())
    }

    fn migrations(&self) -> Vec<Migration> {
        vec![
            Migration {
                id: "001_create_books",
                up: CREATE_BOOKS,
            },
            Migration {
                id: "002_create_borrowing_records",
                up: CREATE_BORROWING_RECORDS,
            },
        ]
    }

    async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!(module = self.name(), "books module stopped");
        Ok(())
    }
}

fn error_response(description: &str) -> serde_json::Value {
    serde_json::json!({
        "description": description,
        "content": {
            "application/json": {
                "schema": { "$ref": "#/components/schemas/ErrorResponse" }
            }
        }
    })
}

fn json_response(description: &str, schema: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "description": description,
        "content": { "application/json": { "schema": schema } }
    })
}

fn id_param(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "in": "path",
        "required": true,
        "schema": { "type": "string", "format": "uuid" }
    })
}

fn openapi() -> serde_json::Value {
    serde_json::json!({
        "paths": openapi_paths(),
        "components": { "schemas": openapi_schemas() }
    })
}

fn openapi_paths() -> serde_json::Value {
    let book = serde_json::json!({ "$ref": "#/components/schemas/Book" });
    let view = serde_json::json!({ "$ref": "#/components/schemas/BookView" });
    let record = serde_json::json!({ "$ref": "#/components/schemas/BorrowingRecord" });
    let body = |schema: &str| {
        serde_json::json!({
            "required": true,
            "content": {
                "application/json": {
                    "schema": { "$ref": format!("#/components/schemas/{schema}") }
                }
            }
        })
    };
    let query = |name: &str, schema: serde_json::Value| {
        serde_json::json!({ "name": name, "in": "query", "schema": schema })
    };

    let mut paths = serde_json::Map::new();
    paths.insert(
        "/".into(),
        serde_json::json!({
            "get": {
                "summary": "List books",
                "tags": ["Books"],
                "parameters": [
                    query("title", serde_json::json!({ "type": "string" })),
                    query("author", serde_json::json!({ "type": "string" })),
                    query("category", serde_json::json!({ "type": "string", "format": "uuid" })),
                    query("page", serde_json::json!({ "type": "integer", "minimum": 1 }))
                ],
                "responses": {
                    "200": json_response("One page of books", serde_json::json!({ "type": "array", "items": view.clone() })),
                    "502": error_response("Category service failed")
                }
            },
            "post": {
                "summary": "Add a book",
                "tags": ["Books"],
                "requestBody": body("NewBook"),
                "responses": {
                    "201": json_response("Book added", book.clone()),
                    "409": error_response("Duplicate ISBN or id"),
                    "422": error_response("Invalid input")
                }
            }
        }),
    );
    paths.insert(
        "/health".into(),
        serde_json::json!({
            "get": {
                "summary": "Books health check",
                "tags": ["Books"],
                "responses": { "200": { "description": "OK" } }
            }
        }),
    );
    paths.insert(
        "/records".into(),
        serde_json::json!({
            "get": {
                "summary": "List the caller's loans",
                "tags": ["Loans"],
                "parameters": [
                    query("title", serde_json::json!({ "type": "string" })),
                    query("status", serde_json::json!({ "type": "string", "enum": ["borrowed", "returned"] })),
                    query("order", serde_json::json!({ "type": "string", "enum": ["asc", "desc"] }))
                ],
                "responses": {
                    "200": json_response("Loans", serde_json::json!({
                        "type": "array",
                        "items": { "$ref": "#/components/schemas/Loan" }
                    }))
                }
            }
        }),
    );
    paths.insert(
        "/{id}".into(),
        serde_json::json!({
            "get": {
                "summary": "Get a book",
                "tags": ["Books"],
                "parameters": [id_param("id")],
                "responses": {
                    "200": json_response("Book", view),
                    "404": error_response("Book not found")
                }
            },
            "put": {
                "summary": "Update a book at a known version",
                "tags": ["Books"],
                "parameters": [id_param("id")],
                "requestBody": body("BookUpdate"),
                "responses": {
                    "200": json_response("Updated book", book),
                    "409": error_response("Stale version or duplicate ISBN")
                }
            },
            "delete": {
                "summary": "Delete a book",
                "tags": ["Books"],
                "parameters": [id_param("id")],
                "responses": {
                    "204": { "description": "Deleted" },
                    "409": error_response("Copies still on loan")
                }
            }
        }),
    );
    paths.insert(
        "/{id}/borrow".into(),
        serde_json::json!({
            "post": {
                "summary": "Borrow a copy",
                "tags": ["Loans"],
                "parameters": [id_param("id")],
                "requestBody": body("BorrowRequest"),
                "responses": {
                    "201": json_response("Loan opened", record.clone()),
                    "404": error_response("Book not found"),
                    "409": error_response("No copies left or concurrent update")
                }
            }
        }),
    );
    paths.insert(
        "/{id}/records".into(),
        serde_json::json!({
            "get": {
                "summary": "List every loan of a book",
                "tags": ["Loans"],
                "parameters": [id_param("id")],
                "responses": {
                    "200": json_response("Loans", serde_json::json!({ "type": "array", "items": record.clone() }))
                }
            }
        }),
    );
    paths.insert(
        "/{id}/records/{record_id}".into(),
        serde_json::json!({
            "put": {
                "summary": "Return a borrowed copy",
                "tags": ["Loans"],
                "parameters": [id_param("id"), id_param("record_id")],
                "responses": {
                    "200": json_response("Loan closed", record),
                    "404": error_response("Record not found"),
                    "409": error_response("Already returned or concurrent update")
                }
            }
        }),
    );
    serde_json::Value::Object(paths)
}

fn openapi_schemas() -> serde_json::Value {
    let uuid = serde_json::json!({ "type": "string", "format": "uuid" });
    let string = serde_json::json!({ "type": "string" });
    let date = serde_json::json!({ "type": "string", "format": "date" });
    let timestamp = serde_json::json!({ "type": "string", "format": "date-time" });
    let integer = serde_json::json!({ "type": "integer" });

    let mut schemas = serde_json::Map::new();
    schemas.insert(
        "Book".into(),
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": uuid, "title": string, "author": string, "isbn": string,
                "published_date": date, "category_id": uuid, "stock": integer,
                "added_by": uuid, "created_at": timestamp, "updated_at": timestamp,
                "version": integer
            },
            "required": ["id", "title", "author", "stock", "added_by", "version"]
        }),
    );
    schemas.insert(
        "BookView".into(),
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": uuid, "title": string, "author": string, "isbn": string,
                "published_date": date, "category_id": uuid, "category": string,
                "stock": integer, "version": integer
            },
            "required": ["id", "title", "author", "category", "stock", "version"]
        }),
    );
    schemas.insert(
        "NewBook".into(),
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": uuid, "title": string, "author": string, "isbn": string,
                "published_date": date, "category_id": uuid, "stock": integer
            },
            "required": ["title", "author"]
        }),
    );
    schemas.insert(
        "BookUpdate".into(),
        serde_json::json!({
            "type": "object",
            "properties": {
                "title": string, "author": string, "isbn": string, "published_date": date,
                "category_id": uuid, "stock": integer, "version": integer
            },
            "required": ["title", "author", "stock", "version"]
        }),
    );
    schemas.insert(
        "BorrowRequest".into(),
        serde_json::json!({
            "type": "object",
            "properties": { "due_date": timestamp }
        }),
    );
    schemas.insert(
        "BorrowingRecord".into(),
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": uuid, "book_id": uuid, "borrower_id": uuid,
                "borrowed_at": timestamp, "due_date": timestamp, "returned_at": timestamp
            },
            "required": ["id", "book_id", "borrower_id", "borrowed_at"]
        }),
    );
    schemas.insert(
        "Loan".into(),
        serde_json::json!({
            "allOf": [
                { "$ref": "#/components/schemas/BorrowingRecord" },
                {
                    "type": "object",
                    "properties": {
                        "status": { "type": "string", "enum": ["borrowed", "returned"] },
                        "title": string,
                        "author": string
                    }
                }
            ]
        }),
    );
    serde_json::Value::Object(schemas)
}

/// Create a new instance of the books module
pub fn create_module() -> Arc<dyn Module> {
    Arc::new(BooksModule::new())
}
