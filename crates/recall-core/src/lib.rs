//! Recall - agent orchestration with long-term memory
//!
//! Library exports for the `recall` binary and integration tests.

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod state;

pub use config::config;
pub use error::{Error, Result};
pub use state::AppState;
