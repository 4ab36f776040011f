use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Users are owned by the bot; the balance guard lives in the schema too
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGINT PRIMARY KEY,
            external_account_name VARCHAR(255),
            provider_credential TEXT,
            balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
            locale VARCHAR(16) NOT NULL DEFAULT 'en'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS training_jobs (
            id UUID PRIMARY KEY,
            owner_id BIGINT NOT NULL REFERENCES users(id),
            model_name VARCHAR(255) NOT NULL,
            trigger_word VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            provider_job_id VARCHAR(255),
            cost_reserved BIGINT NOT NULL DEFAULT 0,
            result_url TEXT,
            error_message VARCHAR(255),
            refunded BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "ALTER TABLE training_jobs ADD COLUMN IF NOT EXISTS refunded BOOLEAN NOT NULL DEFAULT FALSE",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_training_jobs_provider_job_id \
         ON training_jobs(provider_job_id) WHERE provider_job_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_training_jobs_owner_id ON training_jobs(owner_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_training_jobs_status ON training_jobs(status)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
