//! PostgreSQL run window store over the `last_run_time` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{decide, RunWindowStore, WindowDecision, WindowReservation};
use crate::constants::RUN_WINDOW_ROW_ID;
use crate::error::PollerResult;

#[derive(Debug, Clone)]
pub struct PgRunWindowStore {
    pool: PgPool,
}

impl PgRunWindowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunWindowStore for PgRunWindowStore {
    async fn try_advance(
        &self,
        now: DateTime<Utc>,
        min_interval_minutes: i64,
        default_last_run: DateTime<Utc>,
    ) -> PollerResult<WindowDecision> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_run FROM last_run_time WHERE id = $1 FOR UPDATE")
                .bind(RUN_WINDOW_ROW_ID)
                .fetch_optional(&mut *tx)
                .await?;

        let previous = match locked {
            Some(previous) => previous,
            None => {
                // A concurrent first run may insert between our read and this insert;
                // ON CONFLICT waits for it and the re-read below locks its row.
                sqlx::query(
                    "INSERT INTO last_run_time (id, last_run) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
                )
                .bind(RUN_WINDOW_ROW_ID)
                .bind(default_last_run)
                .execute(&mut *tx)
                .await?;

                sqlx::query_scalar::<_, DateTime<Utc>>(
                    "SELECT last_run FROM last_run_time WHERE id = $1 FOR UPDATE",
                )
                .bind(RUN_WINDOW_ROW_ID)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        let decision = decide(previous, now, min_interval_minutes);
        if let WindowDecision::Proceed(reservation) = &decision {
            sqlx::query("UPDATE last_run_time SET last_run = $1 WHERE id = $2")
                .bind(reservation.advanced_to)
                .bind(RUN_WINDOW_ROW_ID)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(decision)
    }

    async fn insert_if_absent(&self, default_last_run: DateTime<Utc>) -> PollerResult<bool> {
        let result = sqlx::query(
            "INSERT INTO last_run_time (id, last_run) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(RUN_WINDOW_ROW_ID)
        .bind(default_last_run)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert(&self, reservation: &WindowReservation) -> PollerResult<bool> {
        let result = sqlx::query(
            "UPDATE last_run_time SET last_run = $1 WHERE id = $2 AND last_run = $3",
        )
        .bind(reservation.previous)
        .bind(RUN_WINDOW_ROW_ID)
        .bind(reservation.advanced_to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_last_run(&self, last_run: DateTime<Utc>) -> PollerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO last_run_time (id, last_run) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET last_run = EXCLUDED.last_run
            "#,
        )
        .bind(RUN_WINDOW_ROW_ID)
        .bind(last_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_run(&self) -> PollerResult<Option<DateTime<Utc>>> {
        let last_run = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_run FROM last_run_time WHERE id = $1",
        )
        .bind(RUN_WINDOW_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        Ok(last_run)
    }
}
