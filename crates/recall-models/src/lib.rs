//! Data models for Recall.
//!
//! Defines the core types shared across the workspace: memory records,
//! extraction chunks, weighted retrieval results and the agent session
//! ledger entries.
//!
//! This crate can be used with or without sqlx support:
//! - Default: No database dependencies, pure data structures
//! - With `sqlx` feature: Adds `FromRow` derive for ledger rows

mod agent;
mod memory;

pub use agent::*;
pub use memory::*;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new UUID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Errors raised when a model invariant is violated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}
