//! Payment reservation
//!
//! Validates that a user can pay for a training and atomically debits the
//! cost. Any rejection happens before the debit, so a failed reservation
//! never changes the balance.

use std::sync::Arc;

use kiln_core::domain::job::TrainingJob;
use kiln_core::domain::user::User;
use thiserror::Error;

use crate::repository::{StoreError, UserStore};

/// Reasons a user cannot start a training. Raised before any debit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("no destination account configured")]
    MissingDestination,

    #[error("no provider credential configured")]
    MissingCredential,

    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: i64, need: i64 },
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The guarded debit affected no rows (balance changed underneath us)
    #[error("payment for user {0} could not be applied")]
    PaymentFailed(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a submission needs once the cost has been reserved
#[derive(Debug, Clone)]
pub struct PreparedContext {
    pub user: User,
    /// Resolved destination account
    pub account: String,
    pub credential: String,
    /// Amount actually debited
    pub cost: i64,
}

pub struct PaymentReservation {
    users: Arc<dyn UserStore>,
    default_destination: Option<String>,
}

impl PaymentReservation {
    pub fn new(users: Arc<dyn UserStore>, default_destination: Option<String>) -> Self {
        Self {
            users,
            default_destination,
        }
    }

    /// Validate the user and reserve `cost` from their balance
    pub async fn prepare(&self, owner_id: i64, cost: i64) -> Result<PreparedContext, PaymentError> {
        let user = self
            .users
            .find_by_id(owner_id)
            .await?
            .ok_or(ValidationError::UserNotFound(owner_id))?;

        let account = user
            .destination(self.default_destination.as_deref())
            .ok_or(ValidationError::MissingDestination)?
            .to_string();

        let credential = user
            .provider_credential
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or(ValidationError::MissingCredential)?;

        if user.balance < cost {
            return Err(ValidationError::InsufficientFunds {
                have: user.balance,
                need: cost,
            }
            .into());
        }

        if cost > 0 && !self.users.debit_if_sufficient(owner_id, cost).await? {
            tracing::warn!(
                "Debit of {} for user {} affected no rows (concurrent spend)",
                cost,
                owner_id
            );
            return Err(PaymentError::PaymentFailed(owner_id));
        }

        tracing::info!("Reserved {} from user {}", cost, owner_id);

        Ok(PreparedContext {
            user,
            account,
            credential,
            cost,
        })
    }

    /// Credit a job's reserved cost back, at most once per job
    ///
    /// Safe to repeat after an error: a refund that already committed is
    /// reported as done without crediting again.
    pub async fn refund_job(&self, job: &TrainingJob) -> Result<bool, StoreError> {
        if job.cost_reserved <= 0 {
            return Ok(true);
        }

        let credited = self
            .users
            .credit_for_job(job.id, job.owner_id, job.cost_reserved)
            .await?;
        if credited {
            tracing::info!(
                "Refunded {} to user {} for job {}",
                job.cost_reserved,
                job.owner_id,
                job.id
            );
        } else {
            tracing::error!(
                "Refund of {} for job {} failed: user {} not found",
                job.cost_reserved,
                job.id,
                job.owner_id
            );
        }
        Ok(credited)
    }

    /// Credit `cost` back for a debit that has no job record
    pub async fn refund(&self, owner_id: i64, cost: i64) -> Result<bool, StoreError> {
        if cost <= 0 {
            return Ok(true);
        }

        let credited = self.users.credit(owner_id, cost).await?;
        if credited {
            tracing::info!("Refunded {} to user {}", cost, owner_id);
        } else {
            tracing::error!("Refund of {} failed: user {} not found", cost, owner_id);
        }
        Ok(credited)
    }
}
