//! HTTP surface of the books module, mounted under `/api/books`.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use time::OffsetDateTime;

use libris_authz::{Principal, Role};
use libris_http::error::AppError;

use crate::utils::parse_page;

use super::error::InventoryError;
use super::models::{BookId, BookQuery, BookUpdate, LoanFilter, NewBook, RecordId, UserId};
use super::service::Inventory;

pub type SharedInventory = Arc<dyn Inventory>;

pub fn router(inventory: SharedInventory) -> Router {
    Router::new()
        .route("/", get(list_books).post(add_book))
        .route("/health", get(health_check))
        .route("/records", get(list_my_loans))
        .route("/{id}", get(get_book).put(update_book).delete(delete_book))
        .route("/{id}/borrow", post(borrow_book))
        .route("/{id}/records", get(loans_for_book))
        .route("/{id}/records/{record_id}", put(return_book))
        .with_state(inventory)
}

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, InventoryError> {
    raw.parse()
        .map_err(|_| InventoryError::invalid(format!("invalid {what} id")))
}

async fn health_check() -> &'static str {
    "books module is healthy"
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    title: Option<String>,
    author: Option<String>,
    category: Option<String>,
    page: Option<String>,
}

async fn list_books(
    State(inventory): State<SharedInventory>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let category_id = match params.category.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_id(raw, "category")?),
    };
    let query = BookQuery {
        title: params.title,
        author: params.author,
        category_id,
        page: parse_page(params.page.as_deref()),
    };
    Ok(Json(inventory.list_books(query).await?))
}

async fn get_book(
    State(inventory): State<SharedInventory>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id: BookId = parse_id(&id, "book")?;
    Ok(Json(inventory.get_book(id).await?))
}

async fn add_book(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Json(new): Json<NewBook>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::Librarian])?;
    let book = inventory
        .add_book(new, UserId::from(principal.subject))
        .await?;
    Ok((StatusCode::CREATED, Json(book)))
}

async fn update_book(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Path(id): Path<String>,
    Json(update): Json<BookUpdate>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::Librarian])?;
    let id: BookId = parse_id(&id, "book")?;
    Ok(Json(inventory.update_book(id, update).await?))
}

async fn delete_book(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::Librarian])?;
    let id: BookId = parse_id(&id, "book")?;
    inventory.delete_book(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct BorrowRequest {
    #[serde(default, with = "time::serde::rfc3339::option")]
    due_date: Option<OffsetDateTime>,
}

async fn borrow_book(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Path(id): Path<String>,
    Json(request): Json<BorrowRequest>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::User])?;
    let id: BookId = parse_id(&id, "book")?;
    let record = inventory
        .borrow(id, UserId::from(principal.subject), request.due_date)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn return_book(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Path((id, record_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::User])?;
    let book_id: BookId = parse_id(&id, "book")?;
    let record_id: RecordId = parse_id(&record_id, "borrowing record")?;
    Ok(Json(inventory.return_loan(record_id, Some(book_id)).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LoanParams {
    title: Option<String>,
    status: Option<String>,
    order: Option<String>,
}

async fn list_my_loans(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Query(params): Query<LoanParams>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::User])?;

    let mut filter = LoanFilter::for_borrower(UserId::from(principal.subject));
    filter.title = params.title;
    if let Some(status) = params.status.as_deref().filter(|s| !s.trim().is_empty()) {
        filter.status = Some(status.parse().map_err(InventoryError::InvalidInput)?);
    }
    if let Some(order) = params.order.as_deref().filter(|s| !s.trim().is_empty()) {
        filter.order = order.parse().map_err(InventoryError::InvalidInput)?;
    }

    Ok(Json(inventory.list_loans(filter).await?))
}

async fn loans_for_book(
    State(inventory): State<SharedInventory>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(&[Role::Librarian])?;
    let id: BookId = parse_id(&id, "book")?;
    Ok(Json(inventory.loans_for_book(id).await?))
}
