//! Verification engine for specialist results
//!
//! Rules-based checks run on every specialist result before it is handed
//! to the controller. Deterministic; no tool calls.

use crate::error::OrchestrationError;
use crate::models::{AgentResult, Phase, RolePayload};
use crate::provenance::ProvenanceRecorder;
use crate::roles::confidence_from_rubric;
use crate::Result;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{info, warn};

/// What a failed rule means for the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Minimum output missing; the phase failed
    Structural,
    /// The result broke the execution protocol
    Protocol,
}

/// Trait for verification rules
pub trait VerificationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ViolationKind;

    fn verify(&self, result: &AgentResult, recorder: &ProvenanceRecorder) -> VerificationCheckResult;
}

pub struct VerificationCheckResult {
    pub passed: bool,
    pub details: String,
}

impl VerificationCheckResult {
    fn pass(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleCheck {
    pub rule_name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub verified: bool,
    /// Most severe failure, if any
    pub violation: Option<ViolationKind>,
    pub checks: Vec<RuleCheck>,
    pub issues: Vec<String>,
}

impl VerificationReport {
    /// Turn a failed report into the pipeline error it implies
    pub fn into_result(self, result: &AgentResult) -> Result<()> {
        let reason = self.issues.join("; ");
        match self.violation {
            None => Ok(()),
            Some(ViolationKind::Protocol) => Err(OrchestrationError::ProtocolViolation {
                role: result.role,
                reason,
            }),
            Some(ViolationKind::Structural) => Err(OrchestrationError::SpecialistFailure {
                role: result.role,
                phase: final_phase(result),
                reason,
            }),
        }
    }
}

fn final_phase(result: &AgentResult) -> Phase {
    match result.payload {
        RolePayload::Basic => Phase::Direct,
        RolePayload::AssumptionBased { .. } => Phase::Finalize,
        RolePayload::Conceptual { .. } => Phase::Explain,
    }
}

/// Verification engine that enforces rules
pub struct VerificationEngine {
    rules: Vec<Box<dyn VerificationRule>>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn VerificationRule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, result: &AgentResult, recorder: &ProvenanceRecorder) -> VerificationReport {
        let mut checks = Vec::with_capacity(self.rules.len());
        let mut issues = Vec::new();
        let mut violation: Option<ViolationKind> = None;

        for rule in &self.rules {
            let outcome = rule.verify(result, recorder);

            if !outcome.passed {
                warn!(
                    question_id = %recorder.question_id(),
                    rule = rule.name(),
                    details = %outcome.details,
                    "Verification rule failed"
                );
                issues.push(format!("{}: {}", rule.name(), outcome.details));
                violation = Some(match violation {
                    Some(current) => current.max(rule.kind()),
                    None => rule.kind(),
                });
            }

            checks.push(RuleCheck {
                rule_name: rule.name().to_string(),
                passed: outcome.passed,
                details: outcome.details,
            });
        }

        let verified = issues.is_empty();

        info!(
            question_id = %recorder.question_id(),
            role = %result.role,
            rule_count = self.rules.len(),
            verified,
            "Verification completed"
        );

        VerificationReport {
            verified,
            violation,
            checks,
            issues,
        }
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= ViolationKind Ordering =================
//

impl PartialOrd for ViolationKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ViolationKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl ViolationKind {
    fn rank(&self) -> u8 {
        match self {
            ViolationKind::Structural => 0,
            ViolationKind::Protocol => 1,
        }
    }
}

//
// ================= Rules =================
//

/// Rule: numeric steps cite a successful invocation or point at an assumption
pub struct StepCitationRule;

impl VerificationRule for StepCitationRule {
    fn name(&self) -> &'static str {
        "step_citation"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::Protocol
    }

    fn verify(&self, result: &AgentResult, recorder: &ProvenanceRecorder) -> VerificationCheckResult {
        for (index, step) in result.steps.iter().enumerate() {
            if let Some(assumption) = step.assumption {
                if assumption >= result.assumptions.len() {
                    return VerificationCheckResult::fail(format!(
                        "step {} points at assumption {} of {}",
                        index,
                        assumption,
                        result.assumptions.len()
                    ));
                }
            }

            for ordinal in &step.citations {
                match recorder.invocation(*ordinal) {
                    Some(inv) if inv.succeeded() => {}
                    Some(_) => {
                        return VerificationCheckResult::fail(format!(
                            "step {} cites failed invocation {}",
                            index, ordinal
                        ))
                    }
                    None => {
                        return VerificationCheckResult::fail(format!(
                            "step {} cites unknown invocation {}",
                            index, ordinal
                        ))
                    }
                }
            }

            if step.result.as_number().is_some()
                && step.citations.is_empty()
                && step.assumption.is_none()
            {
                return VerificationCheckResult::fail(format!(
                    "step {} ('{}') asserts a number with no citation or assumption",
                    index, step.description
                ));
            }
        }

        VerificationCheckResult::pass(format!("{} steps sourced", result.steps.len()))
    }
}

/// Rule: no execute step was recorded before the plan validated
pub struct PhaseOrderingRule;

impl VerificationRule for PhaseOrderingRule {
    fn name(&self) -> &'static str {
        "phase_ordering"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::Protocol
    }

    fn verify(&self, _result: &AgentResult, recorder: &ProvenanceRecorder) -> VerificationCheckResult {
        if recorder.phase_ordering_holds() {
            VerificationCheckResult::pass("execute steps follow plan validation")
        } else {
            VerificationCheckResult::fail("an execute step precedes plan validation")
        }
    }
}

/// Rule: tactical confidence matches the fixed rubric
pub struct ConfidenceRubricRule;

impl VerificationRule for ConfidenceRubricRule {
    fn name(&self) -> &'static str {
        "confidence_rubric"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::Protocol
    }

    fn verify(&self, result: &AgentResult, _recorder: &ProvenanceRecorder) -> VerificationCheckResult {
        if matches!(result.payload, RolePayload::Conceptual { .. }) {
            return VerificationCheckResult::pass("not a tactical result");
        }

        let expected = confidence_from_rubric(&result.steps, &result.assumptions);
        if expected == result.confidence_level {
            VerificationCheckResult::pass(format!("confidence {}", expected))
        } else {
            VerificationCheckResult::fail(format!(
                "reported {} but the rubric gives {}",
                result.confidence_level, expected
            ))
        }
    }
}

/// Rule: each role produced its minimum output
pub struct StructuralCompletenessRule;

impl VerificationRule for StructuralCompletenessRule {
    fn name(&self) -> &'static str {
        "structural_completeness"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::Structural
    }

    fn verify(&self, result: &AgentResult, _recorder: &ProvenanceRecorder) -> VerificationCheckResult {
        match &result.payload {
            RolePayload::Conceptual { explanation, .. } => {
                if explanation.trim().is_empty() {
                    VerificationCheckResult::fail("explanation is empty")
                } else if result.final_value.is_some() {
                    VerificationCheckResult::fail("conceptual result carries a final value")
                } else {
                    VerificationCheckResult::pass("explanation present")
                }
            }
            RolePayload::AssumptionBased { plan } if plan.is_empty() => {
                VerificationCheckResult::fail("plan is empty")
            }
            _ => {
                if result.steps.is_empty() {
                    VerificationCheckResult::fail("no calculation steps")
                } else if result.final_value.is_none() {
                    VerificationCheckResult::fail("no final value")
                } else {
                    VerificationCheckResult::pass("steps and final value present")
                }
            }
        }
    }
}

/// Rule: definition citations point at successful invocations
pub struct DefinitionCitationRule;

impl VerificationRule for DefinitionCitationRule {
    fn name(&self) -> &'static str {
        "definition_citation"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::Protocol
    }

    fn verify(&self, result: &AgentResult, recorder: &ProvenanceRecorder) -> VerificationCheckResult {
        let RolePayload::Conceptual { definitions, .. } = &result.payload else {
            return VerificationCheckResult::pass("no definitions");
        };

        let bad = definitions
            .iter()
            .flat_map(|d| d.citations.iter())
            .find(|ordinal| !recorder.invocation(**ordinal).is_some_and(|inv| inv.succeeded()));

        match bad {
            Some(ordinal) => VerificationCheckResult::fail(format!(
                "definition cites invocation {} which did not succeed",
                ordinal
            )),
            None => VerificationCheckResult::pass(format!("{} definitions", definitions.len())),
        }
    }
}

/// Create a default verification engine with standard rules
pub fn create_default_verification_engine() -> VerificationEngine {
    let mut engine = VerificationEngine::new();
    engine.add_rule(Box::new(StructuralCompletenessRule));
    engine.add_rule(Box::new(StepCitationRule));
    engine.add_rule(Box::new(PhaseOrderingRule));
    engine.add_rule(Box::new(ConfidenceRubricRule));
    engine.add_rule(Box::new(DefinitionCitationRule));
    engine
}

//
// ================= Tests =================
//
