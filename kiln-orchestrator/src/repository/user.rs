//! User Repository
//!
//! Reads users and moves their balance. Debits are a single conditional
//! update, so concurrent reservations for one user serialize in the database
//! without an explicit lock. Job refunds are claimed through a per-job flag in
//! the same transaction as the credit, so repeating one never pays twice.

use async_trait::async_trait;
use kiln_core::domain::user::User;
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;

    /// Debit `amount` only if the balance still covers it
    ///
    /// # Returns
    /// `false` when the user is missing or the balance is insufficient
    async fn debit_if_sufficient(&self, id: i64, amount: i64) -> Result<bool, StoreError>;

    /// Credit `amount` back to the user
    async fn credit(&self, id: i64, amount: i64) -> Result<bool, StoreError>;

    /// Credit `amount` for job `job_id` at most once
    ///
    /// # Returns
    /// `true` when the job's refund is recorded, by this call or an earlier
    /// one; `false` when the user or the job is missing
    async fn credit_for_job(
        &self,
        job_id: Uuid,
        user_id: i64,
        amount: i64,
    ) -> Result<bool, StoreError>;
}

/// Postgres implementation of [`UserStore`]
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, external_account_name, provider_credential, balance, locale
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn debit_if_sufficient(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET balance = balance - $2
            WHERE id = $1 AND balance >= $2
            "#,
        )
        .bind(id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn credit(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET balance = balance + $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn credit_for_job(
        &self,
        job_id: Uuid,
        user_id: i64,
        amount: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE training_jobs SET refunded = TRUE WHERE id = $1 AND NOT refunded",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            let refunded: Option<bool> =
                sqlx::query_scalar("SELECT refunded FROM training_jobs WHERE id = $1")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(refunded.unwrap_or(false));
        }

        let credited = sqlx::query("UPDATE users SET balance = balance + $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        if credited.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    external_account_name: Option<String>,
    provider_credential: Option<String>,
    balance: i64,
    locale: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            external_account_name: row.external_account_name,
            provider_credential: row.provider_credential,
            balance: row.balance,
            locale: row.locale,
        }
    }
}
