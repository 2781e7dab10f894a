//! Specialist roles
//!
//! Basic runs one `direct` phase. Assumption-based runs plan, execute and
//! finalize in that order; execute cannot start before every planned formula
//! carries a validation tag. Conceptual runs one `explain` phase.

use super::{phase_failure, ReasoningAgent, Session};
use crate::error::OrchestrationError;
use crate::models::{
    AgentResult, AgentRole, Assumption, CalculationStep, Classification, ConfidenceLevel,
    Definition, FormulaValidation, Phase, PlannedStep, Question, RolePayload, Stage, ToolKind,
};
use crate::provenance::ProvenanceRecorder;
use crate::reasoning::{StepDraft, TranscriptEntry};
use crate::verification::create_default_verification_engine;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::cmp::min;
use tracing::{info, warn};

const BASIC_INSTRUCTIONS: &str = "You are the basic calculation specialist. Extract the input \
figures from the question or with context_search, apply the standard formula, and confirm the \
formula with at most one web_search. Emit one step per computation.";

const PLAN_INSTRUCTIONS: &str = "You are the assumption-based specialist in the PLAN phase. \
Produce an ordered list of named steps. Every step with a formula must carry a validation tag: \
confirmed (cite the web_search ordinal that confirms it), unconfirmed_assumption (with a \
justification) or failed. Do not compute anything yet.";

const EXECUTE_INSTRUCTIONS: &str = "You are the assumption-based specialist in the EXECUTE phase. \
Follow the validated plan in the handoff context step by step. Look up each input; when a value \
cannot be found, record an explicit assumption instead of guessing.";

const FINALIZE_INSTRUCTIONS: &str = "You are the assumption-based specialist in the FINALIZE \
phase. Report the final value from the executed steps and list any further assumptions.";

const CONCEPTUAL_INSTRUCTIONS: &str = "You are the conceptual specialist. Explain the concept \
the question asks about. Support definitions with context_search or web_search results and cite \
their ordinals. Do not produce a numeric answer.";

#[derive(Debug, Deserialize)]
struct DirectOutput {
    #[serde(default)]
    steps: Vec<StepDraft>,
    final_value: Option<f64>,
    #[serde(default)]
    assumptions: Vec<Assumption>,
}

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(default)]
    steps: Vec<PlannedStep>,
}

#[derive(Debug, Deserialize)]
struct ExecuteOutput {
    #[serde(default)]
    steps: Vec<StepDraft>,
    #[serde(default)]
    assumptions: Vec<Assumption>,
}

#[derive(Debug, Deserialize)]
struct FinalizeOutput {
    final_value: Option<f64>,
    #[serde(default)]
    assumptions: Vec<Assumption>,
}

#[derive(Debug, Deserialize)]
struct ExplainOutput {
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    definitions: Vec<Definition>,
    sub_category: Option<String>,
}

fn parse_output<T: DeserializeOwned>(role: AgentRole, phase: Phase, output: Value) -> Result<T> {
    serde_json::from_value(output)
        .map_err(|e| phase_failure(role, phase, format!("unreadable {} output: {}", phase, e)))
}

/// Fixed confidence rubric for tactical results.
///
/// High: no assumptions and every step cites at least one invocation.
/// Medium: at most two assumptions, none of them low confidence.
/// Low: anything else.
pub fn confidence_from_rubric(steps: &[CalculationStep], assumptions: &[Assumption]) -> ConfidenceLevel {
    if assumptions.is_empty() && !steps.is_empty() && steps.iter().all(|s| !s.citations.is_empty()) {
        ConfidenceLevel::High
    } else if assumptions.len() <= 2
        && assumptions
            .iter()
            .all(|a| a.confidence != ConfidenceLevel::Low)
    {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    }
}

/// Tag a drafted step with its phase and confidence contribution
fn build_step(draft: StepDraft, phase: Phase, assumptions: &[Assumption]) -> CalculationStep {
    let confidence = match draft.assumption.and_then(|i| assumptions.get(i)) {
        Some(assumption) => min(assumption.confidence, ConfidenceLevel::Medium),
        None if !draft.citations.is_empty() => ConfidenceLevel::High,
        None => ConfidenceLevel::Low,
    };

    CalculationStep {
        description: draft.description,
        formula: draft.formula,
        inputs: draft.inputs,
        result: draft.result,
        citations: draft.citations,
        assumption: draft.assumption,
        phase,
        confidence,
    }
}

/// Record assumptions before the steps that point at them
fn record_steps(
    recorder: &mut ProvenanceRecorder,
    assumptions: &[Assumption],
    steps: &[CalculationStep],
) {
    for assumption in assumptions {
        recorder.record_assumption(Stage::Specialist, assumption.clone());
    }
    for step in steps {
        recorder.record_step(Stage::Specialist, step.clone());
    }
}

/// Check every formula's tag. Returns the failed formulas; a missing tag or
/// an unsupported confirmation is a protocol violation.
fn check_plan(plan: &[PlannedStep], transcript: &[TranscriptEntry]) -> Result<Vec<String>> {
    let mut failed = Vec::new();

    for step in plan {
        let Some(formula) = &step.formula else {
            continue;
        };

        match &step.validation {
            None => {
                return Err(OrchestrationError::ProtocolViolation {
                    role: AgentRole::AssumptionBased,
                    reason: format!("formula '{}' in step '{}' has no validation tag", formula, step.name),
                })
            }
            Some(FormulaValidation::Confirmed { citation }) => {
                let supported = transcript.iter().any(|entry| {
                    matches!(
                        entry,
                        TranscriptEntry::ToolResponse { ordinal, tool: ToolKind::WebSearch, .. }
                            if ordinal == citation
                    )
                });
                if !supported {
                    return Err(OrchestrationError::ProtocolViolation {
                        role: AgentRole::AssumptionBased,
                        reason: format!(
                            "formula '{}' claims confirmation by invocation {} which is not a successful web search of this phase",
                            formula, citation
                        ),
                    });
                }
            }
            Some(FormulaValidation::UnconfirmedAssumption { .. }) => {}
            Some(FormulaValidation::Failed { reason }) => {
                failed.push(format!(
                    "Formula '{}' in step '{}' failed validation: {}",
                    formula, step.name, reason
                ));
            }
        }
    }

    Ok(failed)
}

/// One assumption per unconfirmed formula, added when the draft omitted it
fn ensure_formula_assumptions(plan: &[PlannedStep], assumptions: &mut Vec<Assumption>) {
    for step in plan {
        let (Some(formula), Some(FormulaValidation::UnconfirmedAssumption { justification })) =
            (&step.formula, &step.validation)
        else {
            continue;
        };
        if assumptions.iter().any(|a| a.description.contains(formula.as_str())) {
            continue;
        }
        assumptions.push(Assumption {
            description: format!("Formula '{}' used without external confirmation", formula),
            justification: justification.clone(),
            confidence: ConfidenceLevel::Medium,
        });
    }
}

impl ReasoningAgent {
    /// Run the specialist the classification selects and verify its result
    pub async fn run_specialist(
        &self,
        question: &Question,
        classification: &Classification,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<AgentResult> {
        let role = classification.category.specialist_role();
        let handoff = json!({ "classification": classification });

        let result = match role {
            AgentRole::Basic => self.run_basic(question, handoff, recorder).await?,
            AgentRole::AssumptionBased => {
                self.run_assumption_based(question, handoff, recorder)
                    .await?
            }
            AgentRole::Conceptual => self.run_conceptual(question, handoff, recorder).await?,
            other => {
                return Err(OrchestrationError::InvalidHandoff(format!(
                    "{} is not a specialist role",
                    other
                )))
            }
        };

        create_default_verification_engine()
            .verify(&result, recorder)
            .into_result(&result)?;

        info!(
            question_id = %question.question_id,
            role = %result.role,
            confidence = %result.confidence_level,
            steps = result.steps.len(),
            assumptions = result.assumptions.len(),
            "Specialist result accepted"
        );

        Ok(result)
    }

    async fn run_basic(
        &self,
        question: &Question,
        handoff: Value,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<AgentResult> {
        let role = AgentRole::Basic;
        let outcome = self
            .run_session(
                Session::new(role, Phase::Direct, BASIC_INSTRUCTIONS, question)
                    .with_handoff(handoff)
                    .with_web_search_budget(self.policy().basic_web_search_budget),
                recorder,
            )
            .await?;

        let output: DirectOutput = parse_output(role, Phase::Direct, outcome.output)?;
        if output.steps.is_empty() {
            return Err(phase_failure(role, Phase::Direct, "no calculation steps were produced"));
        }
        let final_value = output
            .final_value
            .ok_or_else(|| phase_failure(role, Phase::Direct, "no final value was produced"))?;

        let steps: Vec<CalculationStep> = output
            .steps
            .into_iter()
            .map(|draft| build_step(draft, Phase::Direct, &output.assumptions))
            .collect();
        record_steps(recorder, &output.assumptions, &steps);

        Ok(AgentResult {
            role,
            confidence_level: confidence_from_rubric(&steps, &output.assumptions),
            steps,
            final_value: Some(final_value),
            assumptions: output.assumptions,
            raw_provenance: recorder.invocations_for(Stage::Specialist),
            payload: RolePayload::Basic,
        })
    }

    /// Plan rounds until no formula is tagged failed or revisions run out
    async fn plan(
        &self,
        question: &Question,
        handoff: &Value,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<Vec<PlannedStep>> {
        let role = AgentRole::AssumptionBased;
        let mut notes: Vec<String> = Vec::new();
        let mut revisions = 0u32;

        loop {
            let outcome = self
                .run_session(
                    Session::new(role, Phase::Plan, PLAN_INSTRUCTIONS, question)
                        .with_handoff(handoff.clone())
                        .with_notes(notes.clone()),
                    recorder,
                )
                .await?;

            let output: PlanOutput = parse_output(role, Phase::Plan, outcome.output)?;
            if output.steps.is_empty() {
                return Err(phase_failure(role, Phase::Plan, "plan is empty"));
            }

            let failed = check_plan(&output.steps, &outcome.transcript)?;
            if failed.is_empty() {
                recorder.record_plan_validated(output.steps.len(), revisions);
                return Ok(output.steps);
            }

            if revisions >= self.policy().max_plan_revisions {
                return Err(phase_failure(
                    role,
                    Phase::Plan,
                    format!(
                        "formulas still failing after {} revisions: {}",
                        revisions,
                        failed.join("; ")
                    ),
                ));
            }

            revisions += 1;
            warn!(
                question_id = %question.question_id,
                revision = revisions,
                failed = failed.len(),
                "Plan revision requested"
            );
            notes.extend(failed);
        }
    }

    async fn run_assumption_based(
        &self,
        question: &Question,
        handoff: Value,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<AgentResult> {
        let role = AgentRole::AssumptionBased;

        let plan = self.plan(question, &handoff, recorder).await?;

        let outcome = self
            .run_session(
                Session::new(role, Phase::Execute, EXECUTE_INSTRUCTIONS, question)
                    .with_handoff(json!({
                        "classification": handoff["classification"],
                        "plan": plan,
                    })),
                recorder,
            )
            .await?;

        let executed: ExecuteOutput = parse_output(role, Phase::Execute, outcome.output)?;
        if executed.steps.is_empty() {
            return Err(phase_failure(role, Phase::Execute, "no calculation steps were produced"));
        }

        let mut assumptions = executed.assumptions;
        ensure_formula_assumptions(&plan, &mut assumptions);

        let drafts = executed.steps;
        let steps: Vec<CalculationStep> = drafts
            .iter()
            .cloned()
            .map(|draft| build_step(draft, Phase::Execute, &assumptions))
            .collect();
        record_steps(recorder, &assumptions, &steps);

        let outcome = self
            .run_session(
                Session::new(role, Phase::Finalize, FINALIZE_INSTRUCTIONS, question).with_handoff(
                    json!({
                        "plan": plan,
                        "steps": drafts,
                        "assumptions": assumptions,
                    }),
                ),
                recorder,
            )
            .await?;

        let finalized: FinalizeOutput = parse_output(role, Phase::Finalize, outcome.output)?;
        let final_value = finalized
            .final_value
            .ok_or_else(|| phase_failure(role, Phase::Finalize, "no final value was produced"))?;

        for assumption in finalized.assumptions {
            recorder.record_assumption(Stage::Specialist, assumption.clone());
            assumptions.push(assumption);
        }

        Ok(AgentResult {
            role,
            confidence_level: confidence_from_rubric(&steps, &assumptions),
            steps,
            final_value: Some(final_value),
            assumptions,
            raw_provenance: recorder.invocations_for(Stage::Specialist),
            payload: RolePayload::AssumptionBased { plan },
        })
    }

    async fn run_conceptual(
        &self,
        question: &Question,
        handoff: Value,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<AgentResult> {
        let role = AgentRole::Conceptual;
        let outcome = self
            .run_session(
                Session::new(role, Phase::Explain, CONCEPTUAL_INSTRUCTIONS, question)
                    .with_handoff(handoff),
                recorder,
            )
            .await?;

        let output: ExplainOutput = parse_output(role, Phase::Explain, outcome.output)?;
        if output.explanation.trim().is_empty() {
            return Err(phase_failure(role, Phase::Explain, "explanation is empty"));
        }

        let cited = output.definitions.iter().any(|d| {
            d.citations
                .iter()
                .any(|o| recorder.invocation(*o).is_some_and(|inv| inv.succeeded()))
        });

        Ok(AgentResult {
            role,
            steps: Vec::new(),
            final_value: None,
            confidence_level: if cited {
                ConfidenceLevel::High
            } else {
                ConfidenceLevel::Low
            },
            assumptions: Vec::new(),
            raw_provenance: recorder.invocations_for(Stage::Specialist),
            payload: RolePayload::Conceptual {
                sub_category: output.sub_category,
                explanation: output.explanation,
                definitions: output.definitions,
            },
        })
    }
}
