//! Handoff controller
//!
//! Explicit per-question state machine:
//! Idle → Routed → SpecialistRunning → (Critiquing) → Done | Failed.
//! Owns the question's provenance recorder and every stage output, and is
//! the only place a `QuestionResult` is assembled.

use crate::config::{CriticMode, CriticPolicy};
use crate::error::OrchestrationError;
use crate::models::{
    AgentResult, Category, Classification, ConfidenceLevel, CritiqueReport, FailureDiagnostics,
    FailureReport, PipelineStatus, Question, QuestionResult, Stage,
};
use crate::provenance::ProvenanceRecorder;
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    Idle,
    Routed,
    SpecialistRunning,
    Critiquing,
    Done,
    Failed,
}

impl HandoffState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandoffState::Done | HandoffState::Failed)
    }

    /// Stage that is active while in this state
    fn stage(self) -> Stage {
        match self {
            HandoffState::Idle | HandoffState::Routed => Stage::Router,
            HandoffState::Critiquing => Stage::Critic,
            _ => Stage::Specialist,
        }
    }
}

impl fmt::Display for HandoffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandoffState::Idle => "idle",
            HandoffState::Routed => "routed",
            HandoffState::SpecialistRunning => "specialist_running",
            HandoffState::Critiquing => "critiquing",
            HandoffState::Done => "done",
            HandoffState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct HandoffController {
    question: Question,
    state: HandoffState,
    recorder: ProvenanceRecorder,
    classification: Option<Classification>,
    specialist_result: Option<AgentResult>,
    critique: Option<CritiqueReport>,
    failure: Option<FailureReport>,
    started: Instant,
}

impl HandoffController {
    pub fn new(question: Question) -> Self {
        let recorder = ProvenanceRecorder::new(question.question_id);
        Self {
            question,
            state: HandoffState::Idle,
            recorder,
            classification: None,
            specialist_result: None,
            critique: None,
            failure: None,
            started: Instant::now(),
        }
    }

    pub fn question(&self) -> &Question {
        &self.question
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    pub fn recorder(&self) -> &ProvenanceRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut ProvenanceRecorder {
        &mut self.recorder
    }

    fn transition(&mut self, from: &[HandoffState], to: HandoffState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(OrchestrationError::InvalidHandoff(format!(
                "cannot move from {} to {}",
                self.state, to
            )));
        }
        debug!(
            question_id = %self.question.question_id,
            from = %self.state,
            to = %to,
            "Handoff transition"
        );
        self.state = to;
        Ok(())
    }

    fn expect_state(&self, expected: HandoffState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(OrchestrationError::InvalidHandoff(format!(
                "cannot {} while {}",
                action, self.state
            )));
        }
        Ok(())
    }

    /// Idle → Routed
    pub fn accept_classification(&mut self, classification: Classification) -> Result<()> {
        self.transition(&[HandoffState::Idle], HandoffState::Routed)?;
        self.classification = Some(classification);
        Ok(())
    }

    /// Routed → SpecialistRunning; returns the category being handled
    pub fn begin_specialist(&mut self) -> Result<Category> {
        let category = self
            .classification
            .as_ref()
            .map(|c| c.category)
            .ok_or_else(|| OrchestrationError::InvalidHandoff("no classification".to_string()))?;
        self.transition(&[HandoffState::Routed], HandoffState::SpecialistRunning)?;
        Ok(category)
    }

    /// Store the one specialist result; its role must match the category
    pub fn accept_specialist(&mut self, result: AgentResult) -> Result<()> {
        self.expect_state(HandoffState::SpecialistRunning, "accept a specialist result")?;
        if self.specialist_result.is_some() {
            return Err(OrchestrationError::InvalidHandoff(
                "a specialist result was already accepted".to_string(),
            ));
        }
        let expected = self
            .classification
            .as_ref()
            .map(|c| c.category.specialist_role());
        if expected != Some(result.role) {
            return Err(OrchestrationError::InvalidHandoff(format!(
                "{} result does not match the classification",
                result.role
            )));
        }
        self.specialist_result = Some(result);
        Ok(())
    }

    /// Policy mode for the category, and always for assumption-based
    /// results that are not High
    pub fn critique_required(&self, policy: &CriticPolicy) -> bool {
        let (Some(classification), Some(result)) = (&self.classification, &self.specialist_result)
        else {
            return false;
        };

        let by_policy = match policy.mode_for(classification.category) {
            CriticMode::Never => false,
            CriticMode::Always => true,
            CriticMode::WhenNotHigh => result.confidence_level != ConfidenceLevel::High,
        };
        let forced = classification.category == Category::TacticalAssumptionBased
            && result.confidence_level != ConfidenceLevel::High;

        by_policy || forced
    }

    /// SpecialistRunning → Critiquing
    pub fn begin_critique(&mut self) -> Result<()> {
        if self.specialist_result.is_none() {
            return Err(OrchestrationError::InvalidHandoff(
                "nothing to critique".to_string(),
            ));
        }
        self.transition(&[HandoffState::SpecialistRunning], HandoffState::Critiquing)
    }

    pub fn accept_critique(&mut self, report: CritiqueReport) -> Result<()> {
        self.expect_state(HandoffState::Critiquing, "accept a critique")?;
        let role = self.specialist_result.as_ref().map(|r| r.role);
        if report.target.question_id != self.question.question_id || Some(report.target.role) != role {
            return Err(OrchestrationError::InvalidHandoff(
                "critique targets a different result".to_string(),
            ));
        }
        self.critique = Some(report);
        Ok(())
    }

    /// SpecialistRunning | Critiquing → Done
    pub fn complete(&mut self) -> Result<()> {
        if self.specialist_result.is_none() {
            return Err(OrchestrationError::InvalidHandoff(
                "no specialist result to complete with".to_string(),
            ));
        }
        if self.state == HandoffState::Critiquing && self.critique.is_none() {
            return Err(OrchestrationError::InvalidHandoff(
                "critique pending".to_string(),
            ));
        }
        self.transition(
            &[HandoffState::SpecialistRunning, HandoffState::Critiquing],
            HandoffState::Done,
        )
    }

    /// Any non-terminal state → Failed
    pub fn fail(&mut self, error: &OrchestrationError) -> Result<()> {
        if self.state.is_terminal() {
            return Err(OrchestrationError::InvalidHandoff(format!(
                "cannot fail a question that is already {}",
                self.state
            )));
        }

        if matches!(
            error,
            OrchestrationError::Cancelled(_) | OrchestrationError::DeadlineExceeded(_)
        ) {
            self.recorder.mark_incomplete(self.state.stage(), error.to_string());
        }

        warn!(
            question_id = %self.question.question_id,
            state = %self.state,
            reason_code = error.reason_code(),
            error = %error,
            "Pipeline failed"
        );

        self.failure = Some(FailureReport {
            reason_code: error.reason_code().to_string(),
            message: error.to_string(),
            diagnostics: FailureDiagnostics {
                incomplete: true,
                classification: None,
                specialist_result: None,
            },
        });
        self.state = HandoffState::Failed;
        Ok(())
    }

    /// Assemble the final result. Partial stage outputs of a failed
    /// pipeline appear only inside the failure diagnostics.
    pub fn into_result(self) -> Result<QuestionResult> {
        let status = match self.state {
            HandoffState::Done => PipelineStatus::Completed,
            HandoffState::Failed => PipelineStatus::Failed,
            other => {
                return Err(OrchestrationError::InvalidHandoff(format!(
                    "question is still {}",
                    other
                )))
            }
        };

        let (classification, specialist_result, critique, failure) = match self.failure {
            Some(mut failure) => {
                failure.diagnostics.classification = self.classification;
                failure.diagnostics.specialist_result = self.specialist_result;
                (None, None, None, Some(failure))
            }
            None => (
                self.classification,
                self.specialist_result,
                self.critique,
                None,
            ),
        };

        let recorder = self.recorder;
        Ok(QuestionResult {
            question_id: self.question.question_id,
            question: self.question.text,
            status,
            classification,
            specialist_result,
            critique,
            provenance: recorder.invocations().cloned().collect(),
            audit_trail: recorder.events().to_vec(),
            provenance_complete: recorder.is_complete(),
            incomplete_reason: recorder.incomplete_reason().map(str::to_string),
            failure,
            integrity_hash: recorder.digest(),
            created_at: Utc::now(),
            execution_time_ms: self.started.elapsed().as_millis() as u64,
        })
    }
}
