//! Core data models for the triage orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    TacticalBasic,
    TacticalAssumptionBased,
    Conceptual,
}

impl Category {
    /// The single specialist role that handles this category
    pub fn specialist_role(self) -> AgentRole {
        match self {
            Category::TacticalBasic => AgentRole::Basic,
            Category::TacticalAssumptionBased => AgentRole::AssumptionBased,
            Category::Conceptual => AgentRole::Conceptual,
        }
    }

    pub fn is_tactical(self) -> bool {
        !matches!(self, Category::Conceptual)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::TacticalBasic => "tactical_basic",
            Category::TacticalAssumptionBased => "tactical_assumption_based",
            Category::Conceptual => "conceptual",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ContextSearch,
    WebSearch,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::ContextSearch => "context_search",
            ToolKind::WebSearch => "web_search",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Router,
    Basic,
    AssumptionBased,
    Conceptual,
    Critic,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Router => "router",
            AgentRole::Basic => "basic",
            AgentRole::AssumptionBased => "assumption_based",
            AgentRole::Conceptual => "conceptual",
            AgentRole::Critic => "critic",
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            AgentRole::Router => Stage::Router,
            AgentRole::Critic => Stage::Critic,
            _ => Stage::Specialist,
        }
    }
}

/// Protocol phase a reasoning session runs in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Classify,
    Direct,
    Plan,
    Execute,
    Finalize,
    Explain,
    Review,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Classify => "classify",
            Phase::Direct => "direct",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Finalize => "finalize",
            Phase::Explain => "explain",
            Phase::Review => "review",
        }
    }
}

/// Pipeline stage that owns a provenance event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Router,
    Specialist,
    Critic,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Router => "router",
            Stage::Specialist => "specialist",
            Stage::Critic => "critic",
        }
    }
}

/// Ordered from least to most confident
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultDepth {
    Low,
    #[default]
    Medium,
    High,
}

impl ResultDepth {
    pub fn item_limit(self) -> usize {
        match self {
            ResultDepth::Low => 1,
            ResultDepth::Medium => 3,
            ResultDepth::High => 5,
        }
    }
}

//
// ================= Question =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub question_id: Uuid,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            question_id: Uuid::new_v4(),
            text: text.into(),
            context_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_context_ref(mut self, context_ref: impl Into<String>) -> Self {
        self.context_ref = Some(context_ref.into());
        self
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSearchOptions {
    pub max_results: usize,
    pub include_raw_text: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for ContextSearchOptions {
    fn default() -> Self {
        Self {
            max_results: 5,
            include_raw_text: true,
            filter: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WebSearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default)]
    pub result_depth: ResultDepth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Per-invocation options, one variant per tool kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolOptions {
    ContextSearch(ContextSearchOptions),
    WebSearch(WebSearchOptions),
}

impl ToolOptions {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolOptions::ContextSearch(_) => ToolKind::ContextSearch,
            ToolOptions::WebSearch(_) => ToolKind::WebSearch,
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            ToolOptions::ContextSearch(o) => o.timeout_ms,
            ToolOptions::WebSearch(o) => o.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolItem {
    pub source: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolResult {
    pub items: Vec<ToolItem>,
    pub truncated: bool,
}

impl ToolResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Issuance ordinal within the question's provenance log
    pub ordinal: u64,
    pub stage: Stage,
    pub tool: ToolKind,
    pub query: String,
    pub options: ToolOptions,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }
}

//
// ================= Calculation =================
//

/// Numeric or symbolic step value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepValue {
    Number(f64),
    Symbolic(String),
}

impl StepValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            StepValue::Number(n) => Some(*n),
            StepValue::Symbolic(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assumption {
    pub description: String,
    pub justification: String,
    pub confidence: ConfidenceLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationStep {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, StepValue>,
    pub result: StepValue,
    /// Ordinals of the supporting tool invocations
    #[serde(default)]
    pub citations: Vec<u64>,
    /// Index into the result's assumption list when the step is assumed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumption: Option<usize>,
    pub phase: Phase,
    pub confidence: ConfidenceLevel,
}

/// Validation tag carried by every planned formula
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FormulaValidation {
    Confirmed { citation: u64 },
    UnconfirmedAssumption { justification: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FormulaValidation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Definition {
    pub term: String,
    pub text: String,
    #[serde(default)]
    pub citations: Vec<u64>,
}

//
// ================= Agent Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub rationale: String,
    pub supporting_evidence: Vec<ToolResult>,
}

/// Role-specific part of a specialist result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolePayload {
    Basic,
    AssumptionBased {
        plan: Vec<PlannedStep>,
    },
    Conceptual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_category: Option<String>,
        explanation: String,
        definitions: Vec<Definition>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub role: AgentRole,
    pub steps: Vec<CalculationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_value: Option<f64>,
    pub confidence_level: ConfidenceLevel,
    pub assumptions: Vec<Assumption>,
    pub raw_provenance: Vec<ToolInvocation>,
    pub payload: RolePayload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Revise,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CritiqueTarget {
    pub question_id: Uuid,
    pub role: AgentRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub target: CritiqueTarget,
    pub findings: Vec<Finding>,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rederived_value: Option<f64>,
}

//
// ================= Provenance =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    PhaseStarted { role: AgentRole, phase: Phase },
    ToolInvocation(ToolInvocation),
    CalculationStep(CalculationStep),
    Assumption(Assumption),
    PlanValidated { steps: usize, revisions: u32 },
    Classified { category: Category },
    /// `independent` is false when no critic tool call succeeded
    CritiqueIssued { verdict: Verdict, independent: bool },
    MarkedIncomplete { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub ordinal: u64,
    pub stage: Stage,
    pub recorded_at: DateTime<Utc>,
    pub event: EventKind,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Completed,
    Failed,
}

/// Partial data attached to a failed pipeline, never presented as complete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDiagnostics {
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist_result: Option<AgentResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub reason_code: String,
    pub message: String,
    pub diagnostics: FailureDiagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: Uuid,
    pub question: String,
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist_result: Option<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<CritiqueReport>,
    /// Tool invocations in issuance order
    pub provenance: Vec<ToolInvocation>,
    pub audit_trail: Vec<ProvenanceEvent>,
    pub provenance_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    pub integrity_hash: String,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl QuestionResult {
    pub fn is_failed(&self) -> bool {
        self.status == PipelineStatus::Failed
    }
}

//
// ================= Display =================
//

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::High => "High",
        };
        write!(f, "{}", s)
    }
}
