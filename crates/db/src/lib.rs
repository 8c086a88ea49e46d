//! Postgres connectivity for Libris: pool bootstrap, migrations and the
//! transaction coordinator used by modules that need atomic multi-step writes.

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};

use libris_kernel::settings::DatabaseSettings;

pub mod error;
pub mod migrate;
pub mod tx;

pub use error::DbError;
pub use tx::{PgScope, PgTxCoordinator, TxCoordinator};

/// Open the shared connection pool described by `settings`.
pub async fn connect(settings: &DatabaseSettings) -> anyhow::Result<PgPool> {
    tracing::info!(
        target: "libris-db",
        max_connections = settings.max_connections,
        "connecting to postgres"
    );

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_millis(settings.acquire_timeout_ms))
        .connect(&settings.url)
        .await
        .with_context(|| "failed to connect to postgres")
}
