//! Router role: classifies a question into exactly one category

use super::{ReasoningAgent, Session};
use crate::classifier::QuestionClassifier;
use crate::error::OrchestrationError;
use crate::models::{AgentRole, Category, Classification, Phase, Question, Stage};
use crate::provenance::ProvenanceRecorder;
use crate::Result;
use serde::Deserialize;
use tracing::info;

const ROUTER_INSTRUCTIONS: &str = "You are the routing agent of a financial question triage system. \
Classify the question into exactly one category: tactical_basic (a standard formula over stated or \
retrievable figures), tactical_assumption_based (a number that needs estimates or judgment), or \
conceptual (a definition or explanation). Use context_search to check whether the documents state \
the figures the question needs. A question that asks for a number is never conceptual.";

#[derive(Debug, Deserialize)]
struct ClassifyOutput {
    category: Option<Category>,
    #[serde(default)]
    rationale: String,
}

impl ReasoningAgent {
    /// Classify a question, recording the router's context searches
    pub async fn classify(
        &self,
        question: &Question,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<Classification> {
        if question.text.trim().is_empty() {
            return Err(OrchestrationError::RoutingFailure(
                "question text is empty".to_string(),
            ));
        }

        let outcome = self
            .run_session(
                Session::new(AgentRole::Router, Phase::Classify, ROUTER_INSTRUCTIONS, question),
                recorder,
            )
            .await?;

        let parsed: ClassifyOutput = serde_json::from_value(outcome.output).map_err(|e| {
            OrchestrationError::RoutingFailure(format!("unreadable classification: {}", e))
        })?;
        let proposed = parsed.category.ok_or_else(|| {
            OrchestrationError::RoutingFailure("no category was proposed".to_string())
        })?;

        let router_calls = recorder.invocations_for(Stage::Router);
        // Unconfirmed when the router never looked
        let context_confirmed = !router_calls.is_empty()
            && router_calls
                .iter()
                .all(|inv| inv.succeeded() && inv.raw_result.as_ref().is_some_and(|r| !r.is_empty()));
        let supporting_evidence = router_calls
            .into_iter()
            .filter_map(|inv| inv.raw_result)
            .filter(|r| !r.is_empty())
            .collect();

        let category = QuestionClassifier::apply_tie_break(proposed, question, context_confirmed);
        let rationale = if category != proposed {
            format!(
                "{} (reclassified from {}: the question requests a numeric result)",
                parsed.rationale, proposed
            )
        } else {
            parsed.rationale
        };

        recorder.record_classified(category);

        info!(
            question_id = %question.question_id,
            category = %category,
            "Question classified"
        );

        Ok(Classification {
            category,
            rationale,
            supporting_evidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, ToolConfig};
    use crate::reasoning::{ReasoningCapability, ReasoningRequest, ReasoningTurn, RuleBasedReasoner};
    use crate::tools::{StaticContextTool, StaticWebTool, ToolGateway, SAMPLE_CONTEXT};
    use serde_json::json;
    use std::sync::Arc;

    fn agent_with(reasoner: Arc<dyn ReasoningCapability>) -> ReasoningAgent {
        let gateway = ToolGateway::new()
            .with_backend(Arc::new(StaticContextTool::from_document(
                "context",
                SAMPLE_CONTEXT,
            )))
            .with_backend(Arc::new(StaticWebTool::with_reference_entries()));
        ReasoningAgent::new(
            reasoner,
            Arc::new(gateway),
            PolicyConfig::default(),
            ToolConfig::default(),
        )
    }

    /// Always proposes the conceptual category
    struct ConceptualOnly;

    #[async_trait::async_trait]
    impl ReasoningCapability for ConceptualOnly {
        fn name(&self) -> &'static str {
            "conceptual_only"
        }

        async fn next_turn(&self, _request: &ReasoningRequest<'_>) -> Result<ReasoningTurn> {
            Ok(ReasoningTurn::Complete {
                output: json!({ "category": "conceptual", "rationale": "looks definitional" }),
            })
        }
    }

    #[tokio::test]
    async fn test_classify_records_category() {
        let agent = agent_with(Arc::new(RuleBasedReasoner::new()));
        let question = Question::new("What is Gross Profit in the year ending 2024?");
        let mut recorder = ProvenanceRecorder::new(question.question_id);

        let classification = agent.classify(&question, &mut recorder).await.unwrap();

        assert_eq!(classification.category, Category::TacticalBasic);
        assert!(!classification.supporting_evidence.is_empty());
        assert!(recorder
            .invocations()
            .all(|inv| inv.stage == Stage::Router));
    }

    #[tokio::test]
    async fn test_numeric_question_is_never_conceptual() {
        let agent = agent_with(Arc::new(ConceptualOnly));
        let question = Question::new("Estimate market debt-to-equity ratio");
        let mut recorder = ProvenanceRecorder::new(question.question_id);

        let classification = agent.classify(&question, &mut recorder).await.unwrap();

        // No router context search ran, so the figures are unconfirmed
        assert_eq!(classification.category, Category::TacticalAssumptionBased);
        assert!(classification.rationale.contains("reclassified"));
    }

    #[tokio::test]
    async fn test_empty_question_is_routing_failure() {
        let agent = agent_with(Arc::new(RuleBasedReasoner::new()));
        let question = Question::new("   ");
        let mut recorder = ProvenanceRecorder::new(question.question_id);

        let err = agent.classify(&question, &mut recorder).await.unwrap_err();
        assert_eq!(err.reason_code(), "routing_failure");
        assert!(recorder.events().is_empty());
    }
}
