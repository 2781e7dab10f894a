//! Provenance recorder
//!
//! Append-only, per-question log of every tool invocation, calculation step,
//! assumption and stage transition. Ordinals are strictly increasing and the
//! log is never reordered or deduplicated. Only the owning question's
//! sequential stages append to it, so it carries no synchronization.

use crate::audit::compute_trail_hash;
use crate::models::{
    AgentRole, Assumption, CalculationStep, Category, EventKind, InvocationStatus, Phase,
    ProvenanceEvent, Stage, ToolInvocation, ToolKind, ToolOptions, ToolResult, Verdict,
};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of one gateway call as seen by the recorder
pub struct InvocationRecord<'a> {
    pub stage: Stage,
    pub tool: ToolKind,
    pub query: &'a str,
    pub options: &'a ToolOptions,
    pub outcome: std::result::Result<&'a ToolResult, String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    question_id: Uuid,
    events: Vec<ProvenanceEvent>,
    next_ordinal: u64,
    incomplete_reason: Option<String>,
}

impl ProvenanceRecorder {
    pub fn new(question_id: Uuid) -> Self {
        Self {
            question_id,
            events: Vec::new(),
            next_ordinal: 1,
            incomplete_reason: None,
        }
    }

    pub fn question_id(&self) -> Uuid {
        self.question_id
    }

    fn append(&mut self, stage: Stage, event: EventKind) -> u64 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.events.push(ProvenanceEvent {
            ordinal,
            stage,
            recorded_at: Utc::now(),
            event,
        });
        ordinal
    }

    /// Record a gateway call; returns the invocation ordinal
    pub fn record_invocation(&mut self, record: InvocationRecord<'_>) -> u64 {
        let ordinal = self.next_ordinal;
        let (status, raw_result, error) = match record.outcome {
            Ok(result) => (InvocationStatus::Succeeded, Some(result.clone()), None),
            Err(message) => (InvocationStatus::Failed, None, Some(message)),
        };

        let invocation = ToolInvocation {
            ordinal,
            stage: record.stage,
            tool: record.tool,
            query: record.query.to_string(),
            options: record.options.clone(),
            status,
            raw_result,
            error,
            latency_ms: record.latency_ms,
            recorded_at: Utc::now(),
        };

        debug!(
            question_id = %self.question_id,
            ordinal,
            tool = %record.tool,
            stage = %record.stage,
            status = ?status,
            "Tool invocation recorded"
        );

        self.append(record.stage, EventKind::ToolInvocation(invocation))
    }

    pub fn record_step(&mut self, stage: Stage, step: CalculationStep) -> u64 {
        self.append(stage, EventKind::CalculationStep(step))
    }

    pub fn record_assumption(&mut self, stage: Stage, assumption: Assumption) -> u64 {
        self.append(stage, EventKind::Assumption(assumption))
    }

    pub fn record_phase_started(&mut self, role: AgentRole, phase: Phase) -> u64 {
        self.append(role.stage(), EventKind::PhaseStarted { role, phase })
    }

    pub fn record_plan_validated(&mut self, steps: usize, revisions: u32) -> u64 {
        self.append(Stage::Specialist, EventKind::PlanValidated { steps, revisions })
    }

    pub fn record_classified(&mut self, category: Category) -> u64 {
        self.append(Stage::Router, EventKind::Classified { category })
    }

    pub fn record_critique(&mut self, verdict: Verdict, independent: bool) -> u64 {
        self.append(
            Stage::Critic,
            EventKind::CritiqueIssued {
                verdict,
                independent,
            },
        )
    }

    /// Flag the log as incomplete. Nothing is removed; the first reason wins.
    pub fn mark_incomplete(&mut self, stage: Stage, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            question_id = %self.question_id,
            stage = %stage,
            reason = %reason,
            "Provenance marked incomplete"
        );
        if self.incomplete_reason.is_none() {
            self.incomplete_reason = Some(reason.clone());
        }
        self.append(stage, EventKind::MarkedIncomplete { reason });
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete_reason.is_none()
    }

    pub fn incomplete_reason(&self) -> Option<&str> {
        self.incomplete_reason.as_deref()
    }

    pub fn events(&self) -> &[ProvenanceEvent] {
        &self.events
    }

    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.events.iter().filter_map(|e| match &e.event {
            EventKind::ToolInvocation(inv) => Some(inv),
            _ => None,
        })
    }

    pub fn invocations_for(&self, stage: Stage) -> Vec<ToolInvocation> {
        self.invocations()
            .filter(|inv| inv.stage == stage)
            .cloned()
            .collect()
    }

    pub fn invocation(&self, ordinal: u64) -> Option<&ToolInvocation> {
        self.invocations().find(|inv| inv.ordinal == ordinal)
    }

    pub fn last_invocation(&self) -> Option<&ToolInvocation> {
        self.invocations().last()
    }

    /// True when every execute-phase step follows a validated plan
    pub fn phase_ordering_holds(&self) -> bool {
        let mut plan_validated = false;
        for event in &self.events {
            match &event.event {
                EventKind::PlanValidated { steps, .. } if *steps > 0 => plan_validated = true,
                EventKind::CalculationStep(step) if step.phase == Phase::Execute => {
                    if !plan_validated {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }

    /// SHA-256 over the serialized trail
    pub fn digest(&self) -> String {
        compute_trail_hash(&self.events)
    }
}
