//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services coordinate the stores, the provider gateway and the notifier.

pub mod admission;
pub mod messages;
pub mod notify;
pub mod orchestrator;
pub mod payment;
pub mod poll;
pub mod reconcile;
pub mod step;
pub mod webhook;

// Re-export for convenience
pub use orchestrator::{LaunchOutcome, Orchestrator, OrchestratorError};
pub use webhook::WebhookHandler;
