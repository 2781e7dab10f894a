//! Gemini-backed reasoning capability

use super::{
    output_schema, ReasoningCapability, ReasoningRequest, ReasoningTurn, STEP_DRAFT_SCHEMA,
};
use crate::error::OrchestrationError;
use crate::gemini::GeminiClient;
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

pub struct GeminiReasoner {
    client: GeminiClient,
}

impl GeminiReasoner {
    pub fn new(api_key: String, model: &str) -> Self {
        Self {
            client: GeminiClient::new(api_key, model).with_temperature(0.0),
        }
    }

    /// Build the turn prompt: role instructions, handoff and transcript
    fn build_prompt(&self, request: &ReasoningRequest<'_>) -> Result<String> {
        let transcript = serde_json::to_string_pretty(request.transcript)?;
        let handoff = match request.handoff_context {
            Some(ctx) => serde_json::to_string_pretty(ctx)?,
            None => "none".to_string(),
        };
        let notes = if request.notes.is_empty() {
            "none".to_string()
        } else {
            request.notes.join("\n- ")
        };

        Ok(format!(
            r#"ROLE: {role}
PHASE: {phase}

QUESTION:
{question}

HANDOFF CONTEXT:
{handoff}

REVISION NOTES:
- {notes}

TRANSCRIPT (tool calls so far, cite them by ordinal):
{transcript}

Available tools:
- context_search: search the question's source documents
- web_search: public formulas, definitions and market benchmarks

Rules:
- Return ONLY valid JSON
- No explanation text
- Either request one tool:
  {{ "action": "invoke_tool", "tool": "context_search" | "web_search", "query": "..." }}
- Or finish the phase:
  {{ "action": "complete", "output": {schema} }}
- Never repeat a query already in the transcript
- Every number you assert must cite a transcript ordinal or point at an assumption

{step_schema}
"#,
            role = request.role,
            phase = request.phase,
            question = request.question.text,
            handoff = handoff,
            notes = notes,
            transcript = transcript,
            schema = output_schema(request.phase),
            step_schema = STEP_DRAFT_SCHEMA,
        ))
    }
}

#[async_trait]
impl ReasoningCapability for GeminiReasoner {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn next_turn(&self, request: &ReasoningRequest<'_>) -> Result<ReasoningTurn> {
        let prompt = self.build_prompt(request)?;
        let (response, confidence) = self.client.generate(request.instructions, &prompt).await?;

        debug!(
            role = %request.role,
            phase = %request.phase,
            confidence,
            "Reasoning turn received"
        );

        parse_turn(&response)
    }
}

/// Parse a turn, tolerating a fenced code block around the JSON
fn parse_turn(response: &str) -> Result<ReasoningTurn> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(cleaned).map_err(|e| {
        OrchestrationError::LlmError(format!(
            "Failed to parse reasoning turn: {} | raw={}",
            e, response
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRole, Phase, Question, ToolKind};

    #[test]
    fn test_parse_fenced_turn() {
        let response = "```json\n{\"action\": \"invoke_tool\", \"tool\": \"context_search\", \"query\": \"total debt\"}\n```";
        let turn = parse_turn(response).unwrap();
        assert_eq!(turn, ReasoningTurn::invoke(ToolKind::ContextSearch, "total debt"));
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_turn("The answer is 2.5").unwrap_err();
        assert!(matches!(err, OrchestrationError::LlmError(_)));
    }

    #[test]
    fn test_prompt_carries_phase_schema() {
        let reasoner = GeminiReasoner::new("key".to_string(), "gemini-2.0-flash");
        let question = Question::new("Estimate market debt-to-equity ratio");
        let request = ReasoningRequest {
            role: AgentRole::AssumptionBased,
            phase: Phase::Plan,
            instructions: "plan",
            question: &question,
            handoff_context: None,
            notes: &["Formula 'x' failed validation".to_string()],
            transcript: &[],
        };

        let prompt = reasoner.build_prompt(&request).unwrap();
        assert!(prompt.contains("PHASE: plan"));
        assert!(prompt.contains("unconfirmed_assumption"));
        assert!(prompt.contains("Formula 'x' failed validation"));
    }
}
