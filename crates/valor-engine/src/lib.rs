//! Valor Engine Library
//!
//! Multi-agent orchestration for business and risk validation:
//! - Phase-driven workflows with monotonic progress
//! - Bounded fan-out of capability agents with timeout and retry
//! - Budget admission and tiered model selection
//! - Deterministic synthesis of agent results
//! - `SQLite` persistence of workflow state and results

pub mod capability;
pub mod guard;
pub mod orchestration;
pub mod progress;
pub mod storage;
pub mod workflow;
