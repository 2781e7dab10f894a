//! Agent roles
//!
//! Router, the three specialists and the critic are one [`ReasoningAgent`]
//! running sessions with different instructions, phases and tool policies.
//! A session alternates reasoning turns and gateway calls until the
//! capability completes the phase or the turn budget runs out.

use crate::config::{PolicyConfig, ToolConfig};
use crate::error::OrchestrationError;
use crate::models::{AgentRole, Phase, Question, ToolKind, ToolOptions};
use crate::provenance::ProvenanceRecorder;
use crate::reasoning::{ReasoningCapability, ReasoningRequest, ReasoningTurn, TranscriptEntry};
use crate::tools::ToolGateway;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod critic;
pub mod router;
pub mod specialist;

pub use specialist::confidence_from_rubric;

/// One reasoning session: a role working through a single phase
pub struct Session<'a> {
    pub role: AgentRole,
    pub phase: Phase,
    pub instructions: &'a str,
    pub question: &'a Question,
    pub handoff_context: Option<Value>,
    pub notes: Vec<String>,
    /// Web searches allowed in this session; unlimited when `None`
    pub web_search_budget: Option<usize>,
}

impl<'a> Session<'a> {
    pub fn new(role: AgentRole, phase: Phase, instructions: &'a str, question: &'a Question) -> Self {
        Self {
            role,
            phase,
            instructions,
            question,
            handoff_context: None,
            notes: Vec::new(),
            web_search_budget: None,
        }
    }

    pub fn with_handoff(mut self, context: Value) -> Self {
        self.handoff_context = Some(context);
        self
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_web_search_budget(mut self, budget: usize) -> Self {
        self.web_search_budget = Some(budget);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub output: Value,
    pub transcript: Vec<TranscriptEntry>,
}

/// Failure attributed to the phase that produced it
pub(crate) fn phase_failure(role: AgentRole, phase: Phase, reason: impl Into<String>) -> OrchestrationError {
    match role {
        AgentRole::Router => OrchestrationError::RoutingFailure(reason.into()),
        _ => OrchestrationError::SpecialistFailure {
            role,
            phase,
            reason: reason.into(),
        },
    }
}

/// Shared engine behind every role
pub struct ReasoningAgent {
    reasoner: Arc<dyn ReasoningCapability>,
    gateway: Arc<ToolGateway>,
    policy: PolicyConfig,
    tools: ToolConfig,
}

impl ReasoningAgent {
    pub fn new(
        reasoner: Arc<dyn ReasoningCapability>,
        gateway: Arc<ToolGateway>,
        policy: PolicyConfig,
        tools: ToolConfig,
    ) -> Self {
        Self {
            reasoner,
            gateway,
            policy,
            tools,
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    fn default_options(&self, tool: ToolKind) -> ToolOptions {
        match tool {
            ToolKind::ContextSearch => ToolOptions::ContextSearch(self.tools.context_search_defaults()),
            ToolKind::WebSearch => ToolOptions::WebSearch(self.tools.web_search_defaults()),
        }
    }

    /// Drive one session to completion, recording every tool call
    pub async fn run_session(
        &self,
        session: Session<'_>,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<SessionOutcome> {
        let Session {
            role,
            phase,
            instructions,
            question,
            handoff_context,
            notes,
            web_search_budget,
        } = session;

        recorder.record_phase_started(role, phase);
        let stage = role.stage();

        let mut transcript: Vec<TranscriptEntry> = Vec::new();
        let mut tool_failures = 0usize;
        let mut web_searches = 0usize;

        for turn in 0..self.policy.max_turns {
            let request = ReasoningRequest {
                role,
                phase,
                instructions,
                question,
                handoff_context: handoff_context.as_ref(),
                notes: &notes,
                transcript: &transcript,
            };

            let next = self
                .reasoner
                .next_turn(&request)
                .await
                .map_err(|e| match e {
                    OrchestrationError::LlmError(msg) => phase_failure(role, phase, msg),
                    other => other,
                })?;

            let (tool, query, options) = match next {
                ReasoningTurn::Complete { output } => {
                    info!(
                        question_id = %question.question_id,
                        role = %role,
                        phase = %phase,
                        turns = turn + 1,
                        tool_calls = transcript.len(),
                        "Session complete"
                    );
                    return Ok(SessionOutcome { output, transcript });
                }
                ReasoningTurn::InvokeTool {
                    tool,
                    query,
                    options,
                } => (tool, query, options),
            };

            if let Some(reason) = self.refusal(tool, tool_failures, web_searches, web_search_budget) {
                warn!(
                    question_id = %question.question_id,
                    role = %role,
                    tool = %tool,
                    reason = %reason,
                    "Tool request refused"
                );
                transcript.push(TranscriptEntry::Refused {
                    tool,
                    query,
                    reason,
                });
                continue;
            }

            if tool == ToolKind::WebSearch {
                web_searches += 1;
            }

            let options = options.unwrap_or_else(|| self.default_options(tool));
            debug!(role = %role, tool = %tool, query = %query, "Invoking tool");

            match self
                .gateway
                .invoke(tool, &query, &options, stage, recorder)
                .await
            {
                Ok(result) => {
                    let ordinal = recorder
                        .last_invocation()
                        .map(|inv| inv.ordinal)
                        .unwrap_or_default();
                    transcript.push(TranscriptEntry::ToolResponse {
                        ordinal,
                        tool,
                        query,
                        result,
                    });
                }
                Err(e) if e.is_tool_failure() => {
                    tool_failures += 1;
                    let ordinal = recorder
                        .last_invocation()
                        .map(|inv| inv.ordinal)
                        .unwrap_or_default();
                    transcript.push(TranscriptEntry::ToolFailure {
                        ordinal,
                        tool,
                        query,
                        error: e.to_string(),
                    });
                }
                Err(OrchestrationError::InvalidToolInput(reason)) => {
                    return Err(OrchestrationError::ProtocolViolation {
                        role,
                        reason: format!("invalid tool request: {}", reason),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Err(phase_failure(
            role,
            phase,
            format!(
                "no output after {} reasoning turns",
                self.policy.max_turns
            ),
        ))
    }

    fn refusal(
        &self,
        tool: ToolKind,
        tool_failures: usize,
        web_searches: usize,
        web_search_budget: Option<usize>,
    ) -> Option<String> {
        if tool_failures >= self.policy.max_tool_failures {
            return Some(format!(
                "{} tool failures this session; record an assumption instead",
                tool_failures
            ));
        }
        match web_search_budget {
            Some(budget) if tool == ToolKind::WebSearch && web_searches >= budget => Some(format!(
                "web search budget of {} exhausted",
                budget
            )),
            _ => None,
        }
    }
}
