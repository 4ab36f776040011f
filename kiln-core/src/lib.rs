//! Kiln Core
//!
//! Core types shared by the Kiln training orchestrator and its provider client.
//!
//! This crate contains:
//! - Domain types: Training jobs, users and the provider status vocabulary
//! - DTOs: Request/response bodies exchanged with callers and the provider

pub mod domain;
pub mod dto;
