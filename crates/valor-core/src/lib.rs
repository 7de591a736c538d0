//! Valor Core Library
//!
//! Shared functionality for Valor components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers shared by storage layers
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::{Config, CostProfile, ModelTier};
pub use error::{Error, Result};
