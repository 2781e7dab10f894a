//! Error types for the financial triage orchestrator

use crate::models::{AgentRole, Phase, ToolKind};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Routing failure: {0}")]
    RoutingFailure(String),

    #[error("Specialist failure ({role} / {phase}): {reason}")]
    SpecialistFailure {
        role: AgentRole,
        phase: Phase,
        reason: String,
    },

    #[error("Protocol violation ({role}): {reason}")]
    ProtocolViolation { role: AgentRole, reason: String },

    #[error("Invalid handoff: {0}")]
    InvalidHandoff(String),

    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    #[error("Pipeline deadline of {0} ms exceeded")]
    DeadlineExceeded(u64),

    // =============================
    // Tool Gateway Errors
    // =============================

    #[error("Tool unavailable ({tool}): {reason}")]
    ToolUnavailable { tool: ToolKind, reason: String },

    #[error("Tool timeout ({tool}) after {after_ms:?} ms")]
    ToolTimeout { tool: ToolKind, after_ms: Option<u64> },

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    // =============================
    // Host Errors
    // =============================

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Stable reason code surfaced in failed results
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::RoutingFailure(_) => "routing_failure",
            Self::SpecialistFailure { .. } => "specialist_failure",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::InvalidHandoff(_) => "invalid_handoff",
            Self::Cancelled(_) => "cancelled",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::ToolUnavailable { .. } => "tool_unavailable",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::InvalidToolInput(_) => "invalid_tool_input",
            Self::LlmError(_) => "llm_error",
            Self::ConfigError(_) => "config_error",
            Self::AuditError(_) => "audit_error",
            Self::SerializationError(_) => "serialization_error",
            Self::HttpError(_) => "http_error",
            Self::UuidError(_) => "uuid_error",
            Self::IoError(_) => "io_error",
        }
    }

    /// Tool-level failures are recoverable by the calling agent
    pub fn is_tool_failure(&self) -> bool {
        matches!(self, Self::ToolUnavailable { .. } | Self::ToolTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = OrchestrationError::SpecialistFailure {
            role: AgentRole::AssumptionBased,
            phase: Phase::Finalize,
            reason: "no final value".to_string(),
        };
        assert_eq!(err.reason_code(), "specialist_failure");
        assert!(!err.is_tool_failure());
        assert!(err.to_string().contains("assumption_based / finalize"));

        let timeout = OrchestrationError::ToolTimeout {
            tool: ToolKind::WebSearch,
            after_ms: Some(50),
        };
        assert!(timeout.is_tool_failure());
        assert_eq!(timeout.reason_code(), "tool_timeout");
    }
}
