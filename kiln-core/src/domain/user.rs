//! User domain types
//!
//! Users are owned by the surrounding bot; the orchestrator only reads them
//! and moves their balance through guarded debits and refunds.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    /// Provider namespace the trained model is published under
    pub external_account_name: Option<String>,
    /// Secret used to start trainings on the user's behalf
    #[serde(skip_serializing)]
    pub provider_credential: Option<String>,
    /// Never negative
    pub balance: i64,
    pub locale: String,
}

impl User {
    /// Resolves the destination account, falling back to a configured default.
    pub fn destination<'a>(&'a self, fallback: Option<&'a str>) -> Option<&'a str> {
        self.external_account_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(fallback.filter(|s| !s.is_empty()))
    }
}
