//! Applies module-contributed migrations exactly once.

use sqlx::PgPool;

use libris_kernel::Migration;

use crate::error::DbError;

const LEDGER_TABLE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS libris_migrations (
        module     TEXT        NOT NULL,
        id         TEXT        NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (module, id)
    )
"#;

/// Run every migration not yet recorded in `libris_migrations`.
///
/// Each migration runs in its own transaction together with its bookkeeping
/// row. Returns how many migrations were applied.
pub async fn run(pool: &PgPool, migrations: &[(String, Migration)]) -> Result<usize, DbError> {
    sqlx::raw_sql(LEDGER_TABLE_DDL).execute(pool).await?;

    let mut applied = 0;
    for (module, migration) in migrations {
        let already: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM libris_migrations WHERE module = $1 AND id = $2)",
        )
        .bind(module)
        .bind(migration.id)
        .fetch_one(pool)
        .await?;

        if already {
            tracing::debug!(target: "libris-db", %module, id = migration.id, "migration already applied");
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| DbError::Unavailable(e.to_string()))?;

        sqlx::raw_sql(migration.up).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO libris_migrations (module, id) VALUES ($1, $2)")
            .bind(module)
            .bind(migration.id)
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::CommitFailed(e.to_string()))?;

        tracing::info!(target: "libris-db", %module, id = migration.id, "migration applied");
        applied += 1;
    }

    Ok(applied)
}
