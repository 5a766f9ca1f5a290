//! # Database Migration System
//!
//! Applies the SQL files under `migrations/` in version order and records each one in
//! `poller_schema_migrations`. The files are compiled into the binary, so a deployed
//! poller does not depend on its working directory.
//!
//! ## Concurrency Control
//!
//! Several poller instances may start at once against the same database. The whole
//! run happens on one connection holding a PostgreSQL advisory lock:
//!
//! ```sql
//! SELECT pg_advisory_lock(7320418265511039)
//! ```
//!
//! Later instances block on the lock and then find nothing outstanding.
//!
//! ## Naming
//!
//! Migrations use a timestamp-based naming convention: `YYYYMMDDHHMMSS_description.sql`

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

const MIGRATION_LOCK_KEY: i64 = 7_320_418_265_511_039;

/// Bundled migrations as `(file stem, sql)`
const BUNDLED_MIGRATIONS: &[(&str, &str)] = &[(
    "20191001000000_create_last_run_time",
    include_str!("../../migrations/20191001000000_create_last_run_time.sql"),
)];

/// Represents a single database migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS format)
    pub version: String,
    /// Human-readable migration name
    pub name: String,
    pub sql: &'static str,
}

/// Manages database schema migrations with concurrency safety.
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Run all outstanding migrations in order
    pub async fn run_all(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = Self::run_outstanding_migrations(&mut conn).await;

        // Always release the lock
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    /// Bundled migrations keyed by version
    pub fn bundled() -> BTreeMap<String, Migration> {
        BUNDLED_MIGRATIONS
            .iter()
            .filter_map(|&(stem, sql)| {
                Self::parse_migration_filename(stem).map(|(version, name)| {
                    (
                        version.clone(),
                        Migration {
                            version,
                            name,
                            sql,
                        },
                    )
                })
            })
            .collect()
    }

    async fn run_outstanding_migrations(
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<(), sqlx::Error> {
        Self::ensure_migration_table(conn).await?;
        let applied = Self::get_applied_migrations(conn).await?;

        for migration in Self::bundled().values() {
            if applied.contains(&migration.version) {
                continue;
            }
            info!(
                version = %migration.version,
                name = %migration.name,
                "🗄️ MIGRATIONS: Applying migration"
            );
            sqlx::raw_sql(migration.sql).execute(&mut **conn).await?;
            Self::record_migration(conn, &migration.version).await?;
        }

        Ok(())
    }

    /// Parse migration filename to extract version and name
    fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
        // At least 14 digits + underscore
        if filename.len() < 15 {
            return None;
        }

        let (version_part, name_part) = filename.split_at(14);
        if !version_part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let name = name_part
            .strip_prefix('_')
            .unwrap_or(name_part)
            .replace('_', " ");

        Some((version_part.to_string(), name))
    }

    async fn ensure_migration_table(conn: &mut PoolConnection<Postgres>) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS poller_schema_migrations (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMP WITHOUT TIME ZONE DEFAULT NOW()
            )
        "#,
        )
        .execute(&mut **conn)
        .await?;

        Ok(())
    }

    async fn get_applied_migrations(
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<HashSet<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT version FROM poller_schema_migrations")
            .fetch_all(&mut **conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("version"))
            .collect())
    }

    async fn record_migration(
        conn: &mut PoolConnection<Postgres>,
        version: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO poller_schema_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut **conn)
            .await?;

        Ok(())
    }
}
