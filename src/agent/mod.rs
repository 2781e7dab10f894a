//! Main orchestrator - drives one question through the pipeline
//!
//! ROUTE → SPECIALIST → VERIFY → CRITIQUE? → DONE | FAILED

use crate::audit::AuditLog;
use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::handoff::HandoffController;
use crate::models::{Question, QuestionResult, Verdict};
use crate::reasoning::{create_reasoner, ReasoningCapability};
use crate::roles::ReasoningAgent;
use crate::tools::{create_default_gateway, ToolDescriptor, ToolGateway};
use crate::Result;
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Caller controls for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: CancellationToken,
    /// Whole-pipeline deadline; overrides the configured one
    pub deadline: Option<Duration>,
}

impl RunOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

async fn with_deadline<F>(deadline: Option<Duration>, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(OrchestrationError::DeadlineExceeded(limit.as_millis() as u64))),
        None => work.await,
    }
}

/// Main orchestrator that coordinates the entire workflow
pub struct Orchestrator {
    agent: ReasoningAgent,
    audit_log: AuditLog,
    config: OrchestratorConfig,
    limiter: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        reasoner: Arc<dyn ReasoningCapability>,
        gateway: Arc<ToolGateway>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            reasoner = reasoner.name(),
            concurrency_limit = config.concurrency_limit,
            "Orchestrator initialized"
        );

        Ok(Self {
            agent: ReasoningAgent::new(
                reasoner,
                gateway,
                config.policy.clone(),
                config.tools.clone(),
            ),
            audit_log: AuditLog::with_capacity(config.audit_capacity),
            limiter: Arc::new(Semaphore::new(config.concurrency_limit)),
            config,
        })
    }

    /// Build the reasoner and gateway the configuration selects
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let reasoner = create_reasoner(&config)?;
        let gateway = Arc::new(create_default_gateway(&config)?);
        Self::new(reasoner, gateway, config)
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Tool backends every question shares
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.agent.gateway().tools()
    }

    pub async fn run(&self, question: Question) -> Result<QuestionResult> {
        self.run_with(question, RunOptions::default()).await
    }

    /// Run one question to a terminal state. Pipeline failures come back
    /// as a failed `QuestionResult`; `Err` is reserved for host errors.
    pub async fn run_with(&self, question: Question, options: RunOptions) -> Result<QuestionResult> {
        info!(
            question_id = %question.question_id,
            question = %question.text,
            "Orchestrator: starting question"
        );

        let deadline = options
            .deadline
            .or(self.config.pipeline_deadline_ms.map(Duration::from_millis));
        let mut controller = HandoffController::new(question);

        // A question cancelled while queued never takes a slot
        let permit = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => None,
            permit = self.limiter.acquire() => Some(permit.map_err(|_| {
                OrchestrationError::Cancelled("orchestrator is shutting down".to_string())
            })?),
        };

        let outcome = match permit {
            None => Err(OrchestrationError::Cancelled(
                "run cancelled while queued".to_string(),
            )),
            Some(_permit) => tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    Err(OrchestrationError::Cancelled("run cancelled by caller".to_string()))
                }
                res = with_deadline(deadline, self.drive(&mut controller)) => res,
            },
        };

        if let Err(e) = outcome {
            controller.fail(&e)?;
        }

        let result = controller.into_result()?;
        self.audit_log.record(result.clone()).await?;

        info!(
            question_id = %result.question_id,
            status = ?result.status,
            invocations = result.provenance.len(),
            execution_time_ms = result.execution_time_ms,
            "Orchestrator: question finished"
        );

        Ok(result)
    }

    /// Run several questions concurrently, bounded by the concurrency
    /// limit. Results keep the input order.
    pub async fn run_batch(&self, questions: Vec<Question>) -> Vec<Result<QuestionResult>> {
        join_all(questions.into_iter().map(|q| self.run(q))).await
    }

    async fn drive(&self, controller: &mut HandoffController) -> Result<()> {
        let question = controller.question().clone();

        // === ROUTE ===
        let classification = self
            .agent
            .classify(&question, controller.recorder_mut())
            .await?;
        controller.accept_classification(classification.clone())?;

        // === SPECIALIST ===
        controller.begin_specialist()?;
        let result = self
            .agent
            .run_specialist(&question, &classification, controller.recorder_mut())
            .await?;
        controller.accept_specialist(result.clone())?;

        // === CRITIQUE ===
        if controller.critique_required(&self.config.policy.critic) {
            controller.begin_critique()?;
            let report = self
                .agent
                .critique(&question, &result, controller.recorder_mut())
                .await?;
            if report.verdict == Verdict::Reject {
                warn!(
                    question_id = %question.question_id,
                    "Critic rejected the specialist result"
                );
            }
            controller.accept_critique(report)?;
        }

        controller.complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CriticMode;
    use crate::models::{
        AgentRole, Category, ConfidenceLevel, EventKind, PipelineStatus, RolePayload, Stage,
        ToolKind,
    };
    use crate::reasoning::{ReasoningRequest, ReasoningTurn, RuleBasedReasoner};
    use crate::models::{ToolOptions, ToolResult};
    use crate::tools::{
        FailureInjectingTool, FailureMode, StaticContextTool, StaticWebTool, ToolBackend,
        SAMPLE_CONTEXT,
    };
    use std::collections::HashSet;
    use std::time::Instant;
    use tokio_test::assert_ok;
    use tokio::sync::Notify;

    fn offline_gateway() -> ToolGateway {
        ToolGateway::new()
            .with_backend(Arc::new(StaticContextTool::from_document(
                "context",
                SAMPLE_CONTEXT,
            )))
            .with_backend(Arc::new(StaticWebTool::with_reference_entries()))
    }

    fn orchestrator_with(gateway: ToolGateway, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(Arc::new(RuleBasedReasoner::new()), Arc::new(gateway), config).unwrap()
    }

    fn orchestrator() -> Orchestrator {
        orchestrator_with(offline_gateway(), OrchestratorConfig::default())
    }

    /// Never answers within a test's patience
    struct StalledReasoner;

    #[async_trait::async_trait]
    impl ReasoningCapability for StalledReasoner {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn next_turn(&self, _request: &ReasoningRequest<'_>) -> Result<ReasoningTurn> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ReasoningTurn::invoke(ToolKind::ContextSearch, "never"))
        }
    }

    /// Reports that a search started, then never answers
    struct ParkedWebTool {
        entered: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl ToolBackend for ParkedWebTool {
        fn kind(&self) -> ToolKind {
            ToolKind::WebSearch
        }

        fn description(&self) -> &'static str {
            "parks every search"
        }

        async fn search(&self, _query: &str, _options: &ToolOptions) -> Result<ToolResult> {
            self.entered.notify_one();
            std::future::pending().await
        }
    }

    fn sample_context() -> Arc<StaticContextTool> {
        Arc::new(StaticContextTool::from_document("context", SAMPLE_CONTEXT))
    }

    #[tokio::test]
    async fn test_current_ratio_scenario() {
        let orchestrator = orchestrator();
        let question = Question::new(
            "What is the current ratio given current assets = 1000 and current liabilities = 400?",
        );

        let result = orchestrator.run(question).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(
            result.classification.as_ref().unwrap().category,
            Category::TacticalBasic
        );
        let specialist = result.specialist_result.as_ref().unwrap();
        assert_eq!(specialist.steps.len(), 1);
        assert_eq!(specialist.final_value, Some(2.5));
        assert_eq!(specialist.confidence_level, ConfidenceLevel::High);
        assert!(specialist.assumptions.is_empty());
        assert!(result.critique.is_none());
        assert!(result.provenance_complete);
    }

    #[tokio::test]
    async fn test_market_leverage_scenario() {
        let orchestrator = orchestrator();
        let question = Question::new("Estimate market debt-to-equity ratio");

        let result = orchestrator.run(question).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(
            result.classification.as_ref().unwrap().category,
            Category::TacticalAssumptionBased
        );
        let specialist = result.specialist_result.as_ref().unwrap();
        assert_eq!(specialist.role, AgentRole::AssumptionBased);
        let RolePayload::AssumptionBased { plan } = &specialist.payload else {
            panic!("expected a plan payload");
        };
        assert!(plan.iter().any(|s| s.name == "market_equity"));
        assert!(specialist
            .assumptions
            .iter()
            .any(|a| !a.justification.is_empty()));
        assert_ne!(specialist.confidence_level, ConfidenceLevel::High);

        let critique = result.critique.as_ref().unwrap();
        assert_eq!(critique.verdict, Verdict::Approved);

        // Critic issued a call the specialist did not
        let specialist_calls: HashSet<(ToolKind, String)> = result
            .provenance
            .iter()
            .filter(|inv| inv.stage == Stage::Specialist)
            .map(|inv| (inv.tool, inv.query.to_lowercase()))
            .collect();
        assert!(result
            .provenance
            .iter()
            .filter(|inv| inv.stage == Stage::Critic)
            .any(|inv| !specialist_calls.contains(&(inv.tool, inv.query.to_lowercase()))));

        // No execute step before plan validation
        let validated_at = result
            .audit_trail
            .iter()
            .position(|e| matches!(e.event, EventKind::PlanValidated { .. }))
            .unwrap();
        assert!(result.audit_trail.iter().enumerate().all(|(i, e)| match &e.event {
            EventKind::CalculationStep(step) if step.phase == crate::models::Phase::Execute => {
                i > validated_at
            }
            _ => true,
        }));
    }

    #[tokio::test]
    async fn test_conceptual_scenario() {
        let orchestrator = orchestrator();
        let result = orchestrator.run(Question::new("What is EBITDA?")).await.unwrap();

        assert_eq!(
            result.classification.as_ref().unwrap().category,
            Category::Conceptual
        );
        let specialist = result.specialist_result.as_ref().unwrap();
        assert!(specialist.final_value.is_none());
        let RolePayload::Conceptual { definitions, .. } = &specialist.payload else {
            panic!("expected a conceptual payload");
        };
        assert!(definitions.iter().any(|d| !d.citations.is_empty()));
    }

    #[tokio::test]
    async fn test_benchmark_timeout_is_not_fatal() {
        let gateway = ToolGateway::new()
            .with_backend(Arc::new(StaticContextTool::from_document(
                "context",
                SAMPLE_CONTEXT,
            )))
            .with_backend(Arc::new(
                FailureInjectingTool::new(Arc::new(StaticWebTool::with_reference_entries()))
                    .fail_on("price-to-book", FailureMode::Timeout),
            ));
        let orchestrator = orchestrator_with(gateway, OrchestratorConfig::default());

        let result = orchestrator
            .run(Question::new("Estimate market debt-to-equity ratio"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        let specialist = result.specialist_result.as_ref().unwrap();
        assert_eq!(specialist.confidence_level, ConfidenceLevel::Low);
        assert!(specialist
            .assumptions
            .iter()
            .any(|a| a.confidence == ConfidenceLevel::Low));
        assert!(specialist
            .steps
            .iter()
            .any(|s| s.confidence == ConfidenceLevel::Low));
        assert!(result.provenance.iter().any(|inv| !inv.succeeded()));
    }

    #[tokio::test]
    async fn test_document_timeout_during_execute_is_not_fatal() {
        let gateway = ToolGateway::new()
            .with_backend(Arc::new(
                FailureInjectingTool::new(sample_context())
                    .fail_on("total debt", FailureMode::Timeout),
            ))
            .with_backend(Arc::new(StaticWebTool::with_reference_entries()));
        let orchestrator = orchestrator_with(gateway, OrchestratorConfig::default());

        let result = orchestrator
            .run(Question::new("Estimate market debt-to-equity ratio"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        let specialist = result.specialist_result.as_ref().unwrap();
        assert_eq!(specialist.confidence_level, ConfidenceLevel::Low);

        let value = specialist.final_value.unwrap();
        assert!((value - (0.5 * 4300.0) / (4300.0 * 3.0)).abs() < 1e-9);

        let debt = specialist
            .assumptions
            .iter()
            .find(|a| a.description.contains("total debt"))
            .unwrap();
        assert_eq!(debt.confidence, ConfidenceLevel::Low);
        assert!(debt.justification.contains("failed"));
        assert!(specialist
            .steps
            .iter()
            .any(|s| s.description.contains("total debt") && s.confidence == ConfidenceLevel::Low));

        assert!(result
            .provenance
            .iter()
            .any(|inv| inv.stage == Stage::Specialist && inv.query == "total debt" && !inv.succeeded()));
        assert!(result.critique.is_some());
    }

    #[tokio::test]
    async fn test_critic_tool_outage_yields_revise() {
        let gateway = ToolGateway::new()
            .with_backend(sample_context())
            .with_backend(Arc::new(
                FailureInjectingTool::new(Arc::new(StaticWebTool::with_reference_entries()))
                    .fail_on("meaning", FailureMode::Timeout),
            ));
        let mut config = OrchestratorConfig::default();
        config.policy.critic.conceptual = CriticMode::Always;
        let orchestrator = orchestrator_with(gateway, config);

        let result = orchestrator.run(Question::new("What is EBITDA?")).await.unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        assert!(result.specialist_result.is_some());

        let critique = result.critique.as_ref().unwrap();
        assert_eq!(critique.verdict, Verdict::Revise);
        assert!(critique
            .findings
            .iter()
            .any(|f| f.description.contains("Independent verification was impossible")));
        assert!(result.audit_trail.iter().any(|e| matches!(
            e.event,
            EventKind::CritiqueIssued {
                verdict: Verdict::Revise,
                independent: false
            }
        )));
    }

    #[tokio::test]
    async fn test_router_is_idempotent() {
        let orchestrator = orchestrator();
        let text = "What is Gross Profit in the year ending 2024?";

        let first = orchestrator.run(Question::new(text)).await.unwrap();
        let second = orchestrator.run(Question::new(text)).await.unwrap();

        assert_eq!(
            first.classification.unwrap().category,
            second.classification.unwrap().category
        );
    }

    #[tokio::test]
    async fn test_critic_policy_always_reviews_basic() {
        let mut config = OrchestratorConfig::default();
        config.policy.critic.tactical_basic = CriticMode::Always;
        let orchestrator = orchestrator_with(offline_gateway(), config);

        let result = orchestrator
            .run(Question::new("What is Gross Profit in the year ending 2024?"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Completed);
        let critique = result.critique.unwrap();
        assert_eq!(critique.target.role, AgentRole::Basic);
    }

    #[tokio::test]
    async fn test_empty_question_fails_routing() {
        let orchestrator = orchestrator();
        let result = orchestrator.run(Question::new("")).await.unwrap();

        assert!(result.is_failed());
        assert!(result.specialist_result.is_none());
        let failure = result.failure.unwrap();
        assert_eq!(failure.reason_code, "routing_failure");
        assert!(failure.diagnostics.incomplete);
    }

    #[tokio::test]
    async fn test_cancellation_marks_provenance_incomplete() {
        let orchestrator = orchestrator();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .run_with(
                Question::new("Estimate market debt-to-equity ratio"),
                RunOptions::default().with_cancel(cancel),
            )
            .await
            .unwrap();

        assert!(result.is_failed());
        assert!(!result.provenance_complete);
        assert_eq!(result.failure.unwrap().reason_code, "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_mid_pipeline_keeps_recorded_invocations() {
        let entered = Arc::new(Notify::new());
        let gateway = ToolGateway::new()
            .with_backend(sample_context())
            .with_backend(Arc::new(ParkedWebTool {
                entered: entered.clone(),
            }));
        let orchestrator = orchestrator_with(gateway, OrchestratorConfig::default());
        let cancel = CancellationToken::new();

        let run = orchestrator.run_with(
            Question::new("Estimate market debt-to-equity ratio"),
            RunOptions::default().with_cancel(cancel.clone()),
        );
        let canceller = async {
            entered.notified().await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, canceller);
        let result = result.unwrap();

        assert!(result.is_failed());
        assert!(!result.provenance_complete);
        assert!(result.incomplete_reason.is_some());
        assert!(result
            .provenance
            .iter()
            .any(|inv| inv.stage == Stage::Router && inv.succeeded()));
        assert!(result
            .audit_trail
            .iter()
            .any(|e| matches!(e.event, EventKind::MarkedIncomplete { .. })));

        let failure = result.failure.unwrap();
        assert_eq!(failure.reason_code, "cancelled");
        assert!(failure.diagnostics.classification.is_some());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_does_not_wait_for_a_slot() {
        let mut config = OrchestratorConfig::default();
        config.concurrency_limit = 1;
        let orchestrator =
            Orchestrator::new(Arc::new(StalledReasoner), Arc::new(offline_gateway()), config)
                .unwrap();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let busy = orchestrator.run_with(
            Question::new("What is EBITDA?"),
            RunOptions::default().with_deadline(Duration::from_millis(500)),
        );
        let queued = async {
            let result = orchestrator
                .run_with(
                    Question::new("What is EBITDA?"),
                    RunOptions::default().with_cancel(cancel.clone()),
                )
                .await;
            (result, started.elapsed())
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (busy, (queued, waited), ()) = tokio::join!(busy, queued, canceller);

        assert_eq!(queued.unwrap().failure.unwrap().reason_code, "cancelled");
        assert!(waited < Duration::from_millis(400));
        assert_eq!(busy.unwrap().failure.unwrap().reason_code, "deadline_exceeded");
    }

    #[tokio::test]
    async fn test_deadline_fails_pipeline() {
        let orchestrator = Orchestrator::new(
            Arc::new(StalledReasoner),
            Arc::new(offline_gateway()),
            OrchestratorConfig::default(),
        )
        .unwrap();

        let result = orchestrator
            .run_with(
                Question::new("What is EBITDA?"),
                RunOptions::default().with_deadline(Duration::from_millis(20)),
            )
            .await
            .unwrap();

        assert_eq!(result.failure.unwrap().reason_code, "deadline_exceeded");
        assert!(!result.provenance_complete);
        assert!(result.specialist_result.is_none());
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_audits() {
        let mut config = OrchestratorConfig::default();
        config.concurrency_limit = 2;
        let orchestrator = orchestrator_with(offline_gateway(), config);
        let questions = vec![
            Question::new("What is EBITDA?"),
            Question::new(
                "What is the current ratio given current assets = 1000 and current liabilities = 400?",
            ),
            Question::new("Estimate market debt-to-equity ratio"),
        ];
        let ids: Vec<_> = questions.iter().map(|q| q.question_id).collect();

        let results = orchestrator.run_batch(questions).await;

        let returned: Vec<_> = results
            .iter()
            .map(|r| r.as_ref().unwrap().question_id)
            .collect();
        assert_eq!(returned, ids);
        for id in ids {
            assert!(orchestrator.audit_log().verify_integrity(id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_demo_questions_run_to_an_audited_result() {
        let orchestrator = orchestrator_with(offline_gateway(), OrchestratorConfig::default());
        let questions: Vec<Question> = [
            "What is Gross Profit in the year ending 2024?",
            "What is adjusted EBITDA for the year ending in 2024?",
            "Determine the EV/Sales ratio for 2024.",
            "What is market debt to equity ratio?",
        ]
        .into_iter()
        .map(Question::new)
        .collect();
        let ids: Vec<_> = questions.iter().map(|q| q.question_id).collect();

        for outcome in orchestrator.run_batch(questions).await {
            let result = assert_ok!(outcome);
            let classified = result.classification.is_some()
                || result
                    .failure
                    .as_ref()
                    .is_some_and(|f| f.diagnostics.classification.is_some());
            assert!(classified, "{} was never classified", result.question);
        }
        for id in ids {
            assert!(orchestrator.audit_log().verify_integrity(id).await.unwrap());
        }
    }
}
