//! Core domain types
//!
//! These types represent the business entities persisted by the orchestrator
//! and the vocabulary reported back by the external training provider.

pub mod job;
pub mod provider;
pub mod user;
