//! Financial Triage Orchestrator
//!
//! Routes a natural-language financial question to one of three specialists:
//! - tactical basic: a single direct calculation
//! - tactical assumption-based: plan, execute, finalize with explicit assumptions
//! - conceptual: definitions and explanation, no computation
//!
//! Every tool call is recorded in an ordered provenance trail, assumption-based
//! results may be reviewed by an independent critic, and each finished pipeline
//! is kept in a tamper-evident audit log.
//!
//! PIPELINE:
//! QUESTION → ROUTE → SPECIALIST → CRITIQUE? → RESULT

pub mod agent;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod gemini;
pub mod handoff;
pub mod models;
pub mod provenance;
pub mod reasoning;
pub mod roles;
pub mod tools;
pub mod verification;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::{Orchestrator, RunOptions};
pub use models::*;
