//! Usage-ledger repository implementation.
//!
//! Reserve/commit/release all run inside a single transaction that takes
//! `FOR UPDATE` on the user's account row, so concurrent reservations for
//! the same user serialize and the available balance never goes negative.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use murmur_core::{Error, ReservationHandle, Result, Stage, UsageLedger};

/// PostgreSQL implementation of UsageLedger.
#[derive(Clone)]
pub struct PgUsageLedger {
    pool: Pool<Postgres>,
}

impl PgUsageLedger {
    /// Create a new PgUsageLedger with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Create the account row for a user if absent and add `amount` credits.
    ///
    /// Provisioning belongs to the external billing collaborator; this is
    /// the hook it calls into.
    pub async fn credit(&self, user_id: Uuid, amount: i64) -> Result<i64> {
        let now = Utc::now();
        let balance: i64 = sqlx::query_scalar(
            "INSERT INTO ledger_account (user_id, balance, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE
             SET balance = ledger_account.balance + EXCLUDED.balance, updated_at = $3
             RETURNING balance",
        )
        .bind(user_id)
        .bind(amount)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(balance)
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn reserve(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        stage: Stage,
        estimated_cost: i64,
    ) -> Result<ReservationHandle> {
        if estimated_cost < 0 {
            return Err(Error::InvalidInput("estimated cost must be >= 0".into()));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Lock the balance row; missing account means zero available.
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM ledger_account WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;
        let balance = balance.unwrap_or(0);

        let open: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(estimated_cost), 0)::BIGINT FROM ledger_reservation
             WHERE user_id = $1 AND status = 'reserved'",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let available = balance - open;
        if available < estimated_cost {
            return Err(Error::InsufficientBalance {
                required: estimated_cost,
                available,
            });
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO ledger_reservation
                 (id, user_id, job_id, stage, estimated_cost, status, created_at)
             VALUES ($1, $2, $3, $4, $5, 'reserved', $6)",
        )
        .bind(id)
        .bind(user_id)
        .bind(job_id)
        .bind(stage.as_str())
        .bind(estimated_cost)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "ledger",
            op = "reserve",
            user_id = %user_id,
            job_id = %job_id,
            stage = %stage,
            amount = estimated_cost,
            reservation_id = %id,
            "Reservation placed"
        );

        Ok(ReservationHandle { id, job_id, stage })
    }

    async fn commit(&self, handle: &ReservationHandle, actual_cost: i64) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "SELECT user_id, status FROM ledger_reservation WHERE id = $1 FOR UPDATE",
        )
        .bind(handle.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("reservation {}", handle.id)))?;

        let user_id: Uuid = row.get("user_id");
        let status: String = row.get("status");

        match status.as_str() {
            // Idempotent under crash-recovery replays.
            "committed" => {
                tx.rollback().await.map_err(Error::Database)?;
                return Ok(());
            }
            "released" => {
                return Err(Error::Conflict(format!(
                    "reservation {} was already released",
                    handle.id
                )));
            }
            _ => {}
        }

        sqlx::query(
            "UPDATE ledger_reservation
             SET status = 'committed', actual_cost = $1, resolved_at = $2
             WHERE id = $3",
        )
        .bind(actual_cost)
        .bind(now)
        .bind(handle.id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        // The debit uses the actual cost; the estimate/actual difference is
        // reconciled by this single update under the same transaction.
        sqlx::query(
            "UPDATE ledger_account SET balance = balance - $1, updated_at = $2 WHERE user_id = $3",
        )
        .bind(actual_cost)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "ledger",
            op = "commit",
            user_id = %user_id,
            job_id = %handle.job_id,
            stage = %handle.stage,
            amount = actual_cost,
            reservation_id = %handle.id,
            "Reservation committed"
        );
        Ok(())
    }

    async fn release(&self, handle: &ReservationHandle) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE ledger_reservation
             SET status = 'released', resolved_at = $1
             WHERE id = $2 AND status = 'reserved'",
        )
        .bind(now)
        .bind(handle.id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM ledger_reservation WHERE id = $1")
                    .bind(handle.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::Database)?;

            match status.as_deref() {
                // Already released: retry logic may call release more than
                // once under crash recovery.
                Some("released") | None => return Ok(()),
                Some("committed") => {
                    return Err(Error::Conflict(format!(
                        "reservation {} was already committed",
                        handle.id
                    )));
                }
                Some(other) => {
                    return Err(Error::Internal(format!(
                        "reservation {} in unexpected status {other}",
                        handle.id
                    )));
                }
            }
        }

        debug!(
            subsystem = "ledger",
            op = "release",
            job_id = %handle.job_id,
            stage = %handle.stage,
            reservation_id = %handle.id,
            "Reservation released"
        );
        Ok(())
    }

    async fn release_open_for_job(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE ledger_reservation
             SET status = 'released', resolved_at = $1
             WHERE job_id = $2 AND status = 'reserved'",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn balance(&self, user_id: Uuid) -> Result<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM ledger_account WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(balance.unwrap_or(0))
    }

    async fn open_reservation_total(&self, user_id: Uuid) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(estimated_cost), 0)::BIGINT FROM ledger_reservation
             WHERE user_id = $1 AND status = 'reserved'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(total)
    }
}
