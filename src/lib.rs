//! Advisory Orchestrator
//!
//! Runs a multi-stage financial-advisory workflow:
//! - Named capability providers invoked through one typed registry
//! - A dependency-graph engine that derives concurrency from data edges
//! - A mean-variance allocation solver and annualized risk evaluation
//! - Deterministic report assembly with an auditable content hash
//!
//! FLOW:
//! INPUT → PLAN → EXECUTE → AGGREGATE → AUDIT

pub mod api;
pub mod audit;
pub mod capability;
pub mod config;
pub mod error;
pub mod models;
pub mod optimizer;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod risk;
pub mod trading;

pub use error::{ErrorKind, OrchestrationError, Result};

// Re-export common types
pub use models::*;
