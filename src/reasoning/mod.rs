//! Reasoning capability protocol
//!
//! Agents do not call tools from inside the model. Each turn the agent
//! sends a [`ReasoningRequest`] holding the transcript so far, and the
//! capability answers with exactly one [`ReasoningTurn`]: either a tool
//! request, which the agent executes through the gateway, or the phase's
//! final structured output.

use crate::config::{OrchestratorConfig, ReasoningProvider};
use crate::models::{AgentRole, Phase, Question, StepValue, ToolKind, ToolOptions, ToolResult};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod catalog;
pub mod gemini;
pub mod rule_based;

pub use gemini::GeminiReasoner;
pub use rule_based::RuleBasedReasoner;

/// One entry of a session transcript, in issuance order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    ToolResponse {
        ordinal: u64,
        tool: ToolKind,
        query: String,
        result: ToolResult,
    },
    ToolFailure {
        ordinal: u64,
        tool: ToolKind,
        query: String,
        error: String,
    },
    /// The agent declined to run the request
    Refused {
        tool: ToolKind,
        query: String,
        reason: String,
    },
}

impl TranscriptEntry {
    pub fn tool(&self) -> ToolKind {
        match self {
            TranscriptEntry::ToolResponse { tool, .. }
            | TranscriptEntry::ToolFailure { tool, .. }
            | TranscriptEntry::Refused { tool, .. } => *tool,
        }
    }

    pub fn query(&self) -> &str {
        match self {
            TranscriptEntry::ToolResponse { query, .. }
            | TranscriptEntry::ToolFailure { query, .. }
            | TranscriptEntry::Refused { query, .. } => query,
        }
    }

    pub fn matches(&self, tool: ToolKind, query: &str) -> bool {
        self.tool() == tool && self.query().eq_ignore_ascii_case(query)
    }
}

/// A calculation step as proposed by the capability. Phase and confidence
/// are assigned by the agent when the step is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDraft {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, StepValue>,
    pub result: StepValue,
    #[serde(default)]
    pub citations: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumption: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest<'a> {
    pub role: AgentRole,
    pub phase: Phase,
    pub instructions: &'a str,
    pub question: &'a Question,
    /// Upstream data handed to this phase (plan, steps, result under review)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_context: Option<&'a Value>,
    /// Revision feedback from earlier rounds
    pub notes: &'a [String],
    pub transcript: &'a [TranscriptEntry],
}

impl ReasoningRequest<'_> {
    /// Typed view of one handoff field
    pub fn handoff<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.handoff_context
            .and_then(|ctx| ctx.get(key))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReasoningTurn {
    InvokeTool {
        tool: ToolKind,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<ToolOptions>,
    },
    Complete {
        output: Value,
    },
}

impl ReasoningTurn {
    pub fn invoke(tool: ToolKind, query: impl Into<String>) -> Self {
        ReasoningTurn::InvokeTool {
            tool,
            query: query.into(),
            options: None,
        }
    }
}

/// Turn-level reasoning behind every agent role
#[async_trait::async_trait]
pub trait ReasoningCapability: Send + Sync {
    fn name(&self) -> &'static str;
    async fn next_turn(&self, request: &ReasoningRequest<'_>) -> Result<ReasoningTurn>;
}

/// Shape of the `output` expected when a phase completes
pub fn output_schema(phase: Phase) -> &'static str {
    match phase {
        Phase::Classify => {
            r#"{"category": "tactical_basic" | "tactical_assumption_based" | "conceptual", "rationale": string}"#
        }
        Phase::Direct => {
            r#"{"steps": [StepDraft], "final_value": number | null, "assumptions": [Assumption]}"#
        }
        Phase::Plan => {
            r#"{"steps": [{"name": string, "description": string, "formula": string | null, "validation": {"status": "confirmed", "citation": ordinal} | {"status": "unconfirmed_assumption", "justification": string} | {"status": "failed", "reason": string} | null}]}"#
        }
        Phase::Execute => r#"{"steps": [StepDraft], "assumptions": [Assumption]}"#,
        Phase::Finalize => r#"{"final_value": number | null, "assumptions": [Assumption]}"#,
        Phase::Explain => {
            r#"{"explanation": string, "definitions": [{"term": string, "text": string, "citations": [ordinal]}], "sub_category": string | null}"#
        }
        Phase::Review => {
            r#"{"verdict": "approved" | "revise" | "reject", "findings": [{"severity": "info" | "warning" | "critical", "description": string}], "rederived_value": number | null}"#
        }
    }
}

/// Step shape shared by the Gemini prompt and the rule-based reasoner
pub const STEP_DRAFT_SCHEMA: &str = r#"StepDraft = {"description": string, "formula": string | null, "inputs": {name: number | string}, "result": number | string, "citations": [ordinal], "assumption": index | null}
Assumption = {"description": string, "justification": string, "confidence": "low" | "medium" | "high"}"#;

/// Build the capability the configuration selects
pub fn create_reasoner(config: &OrchestratorConfig) -> Result<Arc<dyn ReasoningCapability>> {
    match config.reasoning.provider {
        ReasoningProvider::RuleBased => Ok(Arc::new(RuleBasedReasoner::new())),
        ReasoningProvider::Gemini => {
            let key = config.reasoning.api_key.clone().ok_or_else(|| {
                crate::error::OrchestrationError::ConfigError(
                    "Gemini reasoning requires GEMINI_API_KEY".to_string(),
                )
            })?;
            Ok(Arc::new(GeminiReasoner::new(key, &config.reasoning.model)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_wire_format() {
        let turn: ReasoningTurn = serde_json::from_value(json!({
            "action": "invoke_tool",
            "tool": "web_search",
            "query": "current ratio formula"
        }))
        .unwrap();
        assert_eq!(
            turn,
            ReasoningTurn::invoke(ToolKind::WebSearch, "current ratio formula")
        );

        let done: ReasoningTurn = serde_json::from_value(json!({
            "action": "complete",
            "output": { "final_value": 2.5 }
        }))
        .unwrap();
        assert!(matches!(done, ReasoningTurn::Complete { .. }));
    }

    #[test]
    fn test_handoff_lookup() {
        let question = Question::new("Estimate market debt-to-equity ratio");
        let context = json!({ "final_value": 0.46 });
        let request = ReasoningRequest {
            role: AgentRole::Critic,
            phase: Phase::Review,
            instructions: "",
            question: &question,
            handoff_context: Some(&context),
            notes: &[],
            transcript: &[],
        };

        assert_eq!(request.handoff::<f64>("final_value"), Some(0.46));
        assert_eq!(request.handoff::<f64>("missing"), None);
    }

    #[test]
    fn test_transcript_matching_ignores_case() {
        let entry = TranscriptEntry::Refused {
            tool: ToolKind::WebSearch,
            query: "Current Ratio Formula".to_string(),
            reason: "budget".to_string(),
        };
        assert!(entry.matches(ToolKind::WebSearch, "current ratio formula"));
        assert!(!entry.matches(ToolKind::ContextSearch, "current ratio formula"));
    }
}
