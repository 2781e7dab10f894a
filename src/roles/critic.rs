//! Critic role: independent review of one specialist result

use super::{phase_failure, ReasoningAgent, Session};
use crate::error::OrchestrationError;
use crate::models::{
    AgentResult, AgentRole, CritiqueReport, CritiqueTarget, Finding, Phase, Question, Severity,
    Stage, ToolInvocation, ToolKind, Verdict,
};
use crate::provenance::ProvenanceRecorder;
use crate::Result;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use tracing::{info, warn};

const CRITIC_INSTRUCTIONS: &str = "You are the critic. Independently re-derive the final value \
(or the key conceptual claims) of the specialist result in the handoff context using your own \
tool calls. Do not reuse the specialist's queries. Report findings with a severity and a verdict: \
approved, revise or reject.";

#[derive(Debug, Deserialize)]
struct ReviewOutput {
    verdict: Option<Verdict>,
    #[serde(default)]
    findings: Vec<Finding>,
    rederived_value: Option<f64>,
}

/// Lowercased, hyphens as spaces, single-spaced
fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .replace('-', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when some successful critic call is not a repeat of a specialist call
fn is_independent(specialist: &[ToolInvocation], critic: &[ToolInvocation]) -> bool {
    let seen: HashSet<(ToolKind, String)> = specialist
        .iter()
        .map(|inv| (inv.tool, normalize_query(&inv.query)))
        .collect();

    critic
        .iter()
        .filter(|inv| inv.succeeded())
        .any(|inv| !seen.contains(&(inv.tool, normalize_query(&inv.query))))
}

impl ReasoningAgent {
    /// Review a specialist result; never mutates it
    pub async fn critique(
        &self,
        question: &Question,
        target: &AgentResult,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<CritiqueReport> {
        let outcome = self
            .run_session(
                Session::new(AgentRole::Critic, Phase::Review, CRITIC_INSTRUCTIONS, question)
                    .with_handoff(json!({ "specialist_result": target })),
                recorder,
            )
            .await?;

        let output: ReviewOutput = serde_json::from_value(outcome.output).map_err(|e| {
            phase_failure(
                AgentRole::Critic,
                Phase::Review,
                format!("unreadable review: {}", e),
            )
        })?;
        let mut verdict = output.verdict.ok_or_else(|| {
            phase_failure(AgentRole::Critic, Phase::Review, "no verdict was issued")
        })?;
        let mut findings = output.findings;

        let critic_calls = recorder.invocations_for(Stage::Critic);
        let verified = critic_calls.iter().any(ToolInvocation::succeeded);
        if verified {
            if !is_independent(&recorder.invocations_for(Stage::Specialist), &critic_calls) {
                return Err(OrchestrationError::ProtocolViolation {
                    role: AgentRole::Critic,
                    reason: "no successful critic invocation differs from the specialist's"
                        .to_string(),
                });
            }
        } else {
            // Tools were down, so the result stands unverified
            warn!(
                question_id = %question.question_id,
                attempted = critic_calls.len(),
                "Critic could not verify independently"
            );
            findings.push(Finding {
                severity: Severity::Critical,
                description: format!(
                    "Independent verification was impossible: none of {} critic tool calls succeeded",
                    critic_calls.len()
                ),
            });
            if verdict == Verdict::Approved {
                verdict = Verdict::Revise;
            }
        }

        recorder.record_critique(verdict, verified);

        info!(
            question_id = %question.question_id,
            verdict = ?verdict,
            findings = findings.len(),
            "Critique issued"
        );

        Ok(CritiqueReport {
            target: CritiqueTarget {
                question_id: question.question_id,
                role: target.role,
            },
            findings,
            verdict,
            rederived_value: output.rederived_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, ToolConfig};
    use crate::models::{
        Classification, Category, ContextSearchOptions, InvocationStatus, ToolOptions,
    };
    use crate::reasoning::RuleBasedReasoner;
    use crate::tools::{StaticContextTool, StaticWebTool, ToolGateway, SAMPLE_CONTEXT};
    use chrono::Utc;
    use std::sync::Arc;

    fn invocation(tool: ToolKind, query: &str, status: InvocationStatus) -> ToolInvocation {
        ToolInvocation {
            ordinal: 1,
            stage: Stage::Critic,
            tool,
            query: query.to_string(),
            options: ToolOptions::ContextSearch(ContextSearchOptions::default()),
            status,
            raw_result: None,
            error: None,
            latency_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_independence_ignores_case_and_hyphens() {
        let specialist = vec![invocation(
            ToolKind::WebSearch,
            "market debt-to-equity ratio formula",
            InvocationStatus::Succeeded,
        )];

        let repeat = vec![invocation(
            ToolKind::WebSearch,
            "Market  debt to equity ratio formula",
            InvocationStatus::Succeeded,
        )];
        assert!(!is_independent(&specialist, &repeat));

        let failed = vec![invocation(
            ToolKind::WebSearch,
            "market debt-to-equity ratio formula verification",
            InvocationStatus::Failed,
        )];
        assert!(!is_independent(&specialist, &failed));

        let other_tool = vec![invocation(
            ToolKind::ContextSearch,
            "market debt-to-equity ratio formula",
            InvocationStatus::Succeeded,
        )];
        assert!(is_independent(&specialist, &other_tool));
    }

    #[tokio::test]
    async fn test_critic_approves_independent_rederivation() {
        let gateway = ToolGateway::new()
            .with_backend(Arc::new(StaticContextTool::from_document(
                "context",
                SAMPLE_CONTEXT,
            )))
            .with_backend(Arc::new(StaticWebTool::with_reference_entries()));
        let agent = ReasoningAgent::new(
            Arc::new(RuleBasedReasoner::new()),
            Arc::new(gateway),
            PolicyConfig::default(),
            ToolConfig::default(),
        );
        let question = Question::new("Estimate market debt-to-equity ratio");
        let mut recorder = ProvenanceRecorder::new(question.question_id);
        let classification = Classification {
            category: Category::TacticalAssumptionBased,
            rationale: "estimate".to_string(),
            supporting_evidence: vec![],
        };

        let result = agent
            .run_specialist(&question, &classification, &mut recorder)
            .await
            .unwrap();
        let snapshot = serde_json::to_value(&result).unwrap();

        let report = agent
            .critique(&question, &result, &mut recorder)
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Approved);
        assert_eq!(report.target.role, AgentRole::AssumptionBased);
        assert!(report.rederived_value.is_some());
        assert_eq!(serde_json::to_value(&result).unwrap(), snapshot);
        assert!(!recorder.invocations_for(Stage::Critic).is_empty());
    }
}
