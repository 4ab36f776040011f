//! Data Transfer Objects
//!
//! Wire representations used between callers, the orchestrator and the
//! training provider.

pub mod provider;
pub mod training;
pub mod webhook;
