//! Libris application library
//!
//! Owns the application modules and the process lifecycle around them:
//! storage bootstrap, migrations, module init/start/stop and the HTTP server.

pub mod modules;
pub mod utils;

use anyhow::Context;
use sqlx::PgPool;

use libris_kernel::settings::{DatabaseBackend, Settings};
use libris_kernel::{InitCtx, ModuleRegistry};

/// Registry holding every application module.
pub fn build_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    modules::register_all(&mut registry);
    registry
}

/// Open the configured storage. `None` selects the in-memory backend.
pub async fn connect_storage(settings: &Settings) -> anyhow::Result<Option<PgPool>> {
    match settings.database.backend {
        DatabaseBackend::Postgres => Ok(Some(libris_db::connect(&settings.database).await?)),
        DatabaseBackend::Memory => {
            tracing::warn!("using in-memory storage; all data is lost on exit");
            Ok(None)
        }
    }
}

async fn apply_migrations(pool: &PgPool, registry: &ModuleRegistry) -> anyhow::Result<usize> {
    let migrations = registry.collect_migrations();
    let applied = libris_db::migrate::run(pool, &migrations)
        .await
        .context("failed to apply migrations")?;
    tracing::info!(applied, total = migrations.len(), "migrations up to date");
    Ok(applied)
}

/// Apply pending migrations and exit. A no-op for the in-memory backend.
pub async fn migrate(settings: &Settings) -> anyhow::Result<usize> {
    let registry = build_registry();
    let Some(pool) = connect_storage(settings).await? else {
        return Ok(0);
    };
    let applied = apply_migrations(&pool, &registry).await;
    pool.close().await;
    applied
}

/// Run the service until a shutdown signal arrives.
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    let registry = build_registry();
    let pool = connect_storage(&settings).await?;
    if let Some(pool) = &pool {
        apply_migrations(pool, &registry).await?;
    }

    let ctx = InitCtx {
        settings: &settings,
        db: pool.as_ref(),
    };
    registry.init_all(&ctx).await?;
    registry.start_all(&ctx).await?;

    let served = libris_http::start_server(&registry, &settings).await;

    registry.stop_all().await?;
    if let Some(pool) = pool {
        pool.close().await;
    }
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn memory_settings() -> Settings {
        let mut settings = Settings::default();
        settings.database.backend = DatabaseBackend::Memory;
        settings.categories.base_url = "http://127.0.0.1:1".to_string();
        settings.categories.timeout_ms = 500;
        settings
    }

    #[test]
    fn registry_contains_books() {
        let registry = build_registry();
        assert_eq!(registry.len(), 1);
        assert!(registry.get_module("books").is_some());
        assert_eq!(registry.collect_migrations().len(), 2);
    }

    #[tokio::test]
    async fn memory_backend_needs_no_database() {
        let settings = memory_settings();
        assert!(connect_storage(&settings).await.unwrap().is_none());
        assert_eq!(migrate(&settings).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_router_serves_books_and_docs() {
        let settings = memory_settings();
        let registry = build_registry();
        registry
            .init_all(&InitCtx {
                settings: &settings,
                db: None,
            })
            .await
            .unwrap();

        let app = libris_http::build_router(&registry, &settings);

        let response = app
            .clone()
            .oneshot(Request::get("/api/books?page=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        // No category service is running, so listing surfaces an upstream failure.
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app
            .clone()
            .oneshot(Request::get("/api/books/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let response = app
            .oneshot(Request::get("/docs/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
