//! Job Repository
//!
//! Persistence for training jobs.
//!
//! Every update is conditional on the row still being in a status the patch
//! may legally move from. Terminal rows therefore never change again, and the
//! caller whose terminal write returns a row is the one that owns the
//! terminal side effects.

use async_trait::async_trait;
use kiln_core::domain::job::{JobPatch, JobStatus, TrainingJob};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;

/// Store contract for training job records
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Persist a new job; repeating it with the same id is a no-op
    async fn create(&self, job: &TrainingJob) -> Result<Uuid, StoreError>;

    /// Apply a patch if the job exists and the transition is allowed
    ///
    /// # Returns
    /// The updated job, or `None` when the job is missing or the guard failed
    async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<Option<TrainingJob>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<TrainingJob>, StoreError>;

    async fn get_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<TrainingJob>, StoreError>;

    /// Jobs still PENDING or PROCESSING, oldest first
    async fn list_active(&self) -> Result<Vec<TrainingJob>, StoreError>;
}

/// Statuses a job may be in for `patch` to apply.
pub fn allowed_from(patch: &JobPatch) -> Vec<JobStatus> {
    match patch.status {
        Some(next) => JobStatus::ACTIVE
            .into_iter()
            .filter(|current| current.can_transition_to(next))
            .collect(),
        None => JobStatus::ACTIVE.to_vec(),
    }
}

/// Postgres implementation of [`JobRecordStore`]
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, owner_id, model_name, trigger_word, status, provider_job_id, \
     cost_reserved, result_url, error_message, created_at, updated_at";

#[async_trait]
impl JobRecordStore for PgJobStore {
    async fn create(&self, job: &TrainingJob) -> Result<Uuid, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO training_jobs
                (id, owner_id, model_name, trigger_word, status, provider_job_id,
                 cost_reserved, result_url, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&job.model_name)
        .bind(&job.trigger_word)
        .bind(job.status.as_str())
        .bind(&job.provider_job_id)
        .bind(job.cost_reserved)
        .bind(&job.result_url)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(job.id)
    }

    async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<Option<TrainingJob>, StoreError> {
        let allowed: Vec<String> = allowed_from(patch)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        if allowed.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            r#"
            UPDATE training_jobs
            SET status = COALESCE($2, status),
                provider_job_id = COALESCE($3, provider_job_id),
                result_url = COALESCE($4, result_url),
                error_message = COALESCE($5, error_message),
                updated_at = $6
            WHERE id = $1 AND status = ANY($7)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(&patch.provider_job_id)
            .bind(&patch.result_url)
            .bind(&patch.error_message)
            .bind(chrono::Utc::now())
            .bind(&allowed)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TrainingJob::try_from).transpose()
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<TrainingJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TrainingJob::try_from).transpose()
    }

    async fn get_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<TrainingJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE provider_job_id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(provider_job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TrainingJob::try_from).transpose()
    }

    async fn list_active(&self) -> Result<Vec<TrainingJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM training_jobs \
             WHERE status IN ('PENDING', 'PROCESSING') ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TrainingJob::try_from).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: i64,
    model_name: String,
    trigger_word: String,
    status: String,
    provider_job_id: Option<String>,
    cost_reserved: i64,
    result_url: Option<String>,
    error_message: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<JobRow> for TrainingJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("job {} has unknown status {}", row.id, row.status))
        })?;

        Ok(TrainingJob {
            id: row.id,
            owner_id: row.owner_id,
            model_name: row.model_name,
            trigger_word: row.trigger_word,
            status,
            provider_job_id: row.provider_job_id,
            cost_reserved: row.cost_reserved,
            result_url: row.result_url,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
