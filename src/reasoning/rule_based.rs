//! Deterministic reasoning capability
//!
//! Works offline from the metric catalogue. Holds no state between turns:
//! every decision is re-derived from the question, the handoff context and
//! the transcript, so a turn either asks for the next missing tool result
//! or completes the phase.

use super::catalog::{self, Metric, Sourcing, Variable};
use super::{ReasoningCapability, ReasoningRequest, ReasoningTurn, StepDraft, TranscriptEntry};
use crate::classifier::QuestionClassifier;
use crate::error::OrchestrationError;
use crate::models::{
    AgentResult, AgentRole, Assumption, Category, ConfidenceLevel, Definition, Finding,
    FormulaValidation, Phase, PlannedStep, Question, Severity, StepValue, ToolItem, ToolKind,
    ToolResult, Verdict,
};
use crate::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// `Err` carries the tool request that must run before the phase can finish
type Progress<T> = std::result::Result<T, ReasoningTurn>;

const UNAVAILABLE: &str = "unavailable";

/// Relative deviation the critic accepts as agreement
const AGREEMENT_TOLERANCE: f64 = 0.01;
/// Relative deviation beyond which the critic rejects outright
const REJECT_TOLERANCE: f64 = 0.25;

pub struct RuleBasedReasoner;

impl RuleBasedReasoner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuleBasedReasoner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ReasoningCapability for RuleBasedReasoner {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    async fn next_turn(&self, request: &ReasoningRequest<'_>) -> Result<ReasoningTurn> {
        let progress = match (request.role, request.phase) {
            (AgentRole::Router, Phase::Classify) => classify(request),
            (AgentRole::Basic, Phase::Direct) => direct(request),
            (AgentRole::AssumptionBased, Phase::Plan) => plan(request),
            (AgentRole::AssumptionBased, Phase::Execute) => execute(request),
            (AgentRole::AssumptionBased, Phase::Finalize) => finalize(request),
            (AgentRole::Conceptual, Phase::Explain) => explain(request),
            (AgentRole::Critic, Phase::Review) => review(request),
            (role, phase) => {
                return Err(OrchestrationError::LlmError(format!(
                    "No rules for the {} role in the {} phase",
                    role, phase
                )))
            }
        };

        Ok(match progress {
            Ok(output) => ReasoningTurn::Complete { output },
            Err(request_tool) => request_tool,
        })
    }
}

//
// ================= Transcript lookups =================
//

enum Lookup<'t> {
    Found { ordinal: u64, result: &'t ToolResult },
    Exhausted(Vec<String>),
}

/// Walk the queries in order; ask for the first one not yet issued
fn lookup<'t>(
    transcript: &'t [TranscriptEntry],
    tool: ToolKind,
    queries: &[String],
    accept: impl Fn(&ToolResult) -> bool,
) -> Progress<Lookup<'t>> {
    let mut problems = Vec::new();

    for query in queries {
        match transcript.iter().find(|e| e.matches(tool, query)) {
            None => return Err(ReasoningTurn::invoke(tool, query.clone())),
            Some(TranscriptEntry::ToolResponse {
                ordinal, result, ..
            }) => {
                if accept(result) {
                    return Ok(Lookup::Found {
                        ordinal: *ordinal,
                        result,
                    });
                }
                problems.push(format!("{} '{}' returned nothing usable", tool, query));
            }
            Some(TranscriptEntry::ToolFailure { error, .. }) => {
                problems.push(format!("{} '{}' failed: {}", tool, query, error));
            }
            Some(TranscriptEntry::Refused { reason, .. }) => {
                problems.push(format!("{} '{}' refused: {}", tool, query, reason));
            }
        }
    }

    Ok(Lookup::Exhausted(problems))
}

fn has_items(result: &ToolResult) -> bool {
    !result.is_empty()
}

/// First stated figure for the variable, primary label before aliases
fn figure_in<'r>(result: &'r ToolResult, variable: &Variable) -> Option<(f64, &'r ToolItem)> {
    variable.labels().find_map(|label| {
        result.items.iter().find_map(|item| {
            catalog::extract_labelled(&item.text, label).map(|value| (value, item))
        })
    })
}

fn value_or_unavailable(value: Option<f64>) -> StepValue {
    value
        .map(StepValue::Number)
        .unwrap_or_else(|| StepValue::Symbolic(UNAVAILABLE.to_string()))
}

//
// ================= Workbook =================
//

#[derive(Debug, Clone, Default)]
struct Sourced {
    value: Option<f64>,
    citations: Vec<u64>,
    assumption: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum FormulaSupport {
    Cited(u64),
    Assumed(usize),
}

/// How variable queries are worded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phrasing {
    Primary,
    /// Reworded so the critic's searches differ from the specialist's
    Independent,
}

impl Phrasing {
    fn context_queries(self, variable: &Variable) -> Vec<String> {
        match self {
            Phrasing::Primary => vec![
                variable.label.to_string(),
                format!("{} total", variable.label),
            ],
            Phrasing::Independent => vec![
                format!("{} as reported", variable.label),
                format!("{} figure", variable.label),
                variable.label.to_string(),
            ],
        }
    }

    /// Web fallback once the documents have nothing for the figure
    fn web_query(self, variable: &Variable) -> String {
        match self {
            Phrasing::Primary => format!("{} latest annual report", variable.label),
            Phrasing::Independent => format!("{} public filing", variable.label),
        }
    }

    fn estimate_query(self, query: &str) -> String {
        match self {
            Phrasing::Primary => query.to_string(),
            Phrasing::Independent => format!("{} benchmark", query),
        }
    }
}

#[derive(Debug, Default)]
struct Workbook {
    values: BTreeMap<&'static str, Sourced>,
    assumptions: Vec<Assumption>,
    steps: Vec<StepDraft>,
}

impl Workbook {
    fn assume(
        &mut self,
        description: String,
        justification: String,
        confidence: ConfidenceLevel,
    ) -> usize {
        self.assumptions.push(Assumption {
            description,
            justification,
            confidence,
        });
        self.assumptions.len() - 1
    }

    fn final_value(&self, metric: &Metric) -> Option<f64> {
        metric
            .result()
            .and_then(|d| self.values.get(d.key))
            .and_then(|s| s.value)
    }

    /// Source every input; question figures first, then tools. Figures no
    /// tool could supply are settled last, from their proxy if they have one.
    fn source_variables(
        &mut self,
        metric: &Metric,
        question: &Question,
        transcript: &[TranscriptEntry],
        phrasing: Phrasing,
        record_steps: bool,
    ) -> Progress<()> {
        let mut missing = Vec::new();

        for variable in metric.variables {
            if let Some(value) = catalog::extract_figure(&question.text, variable) {
                self.values.insert(
                    variable.key,
                    Sourced {
                        value: Some(value),
                        ..Sourced::default()
                    },
                );
                continue;
            }

            let sourced = match variable.sourcing {
                Sourcing::Retrieve => match self.retrieve(variable, transcript, phrasing)? {
                    Ok(sourced) => sourced,
                    Err(problems) => {
                        missing.push((variable, problems));
                        continue;
                    }
                },
                Sourcing::Estimate {
                    query,
                    fallback,
                    justification,
                } => self.estimate(
                    variable,
                    transcript,
                    &phrasing.estimate_query(query),
                    fallback,
                    justification,
                )?,
            };

            self.store(variable, sourced, record_steps);
        }

        for (variable, problems) in missing {
            let sourced = self.stand_in(variable, problems);
            self.store(variable, sourced, record_steps);
        }

        Ok(())
    }

    fn store(&mut self, variable: &Variable, sourced: Sourced, record_step: bool) {
        if record_step {
            let verb = if variable.is_estimate() || sourced.assumption.is_some() {
                "Estimate"
            } else {
                "Retrieve"
            };
            self.steps.push(StepDraft {
                description: format!("{} {}", verb, variable.label),
                formula: None,
                inputs: BTreeMap::new(),
                result: value_or_unavailable(sourced.value),
                citations: sourced.citations.clone(),
                assumption: sourced.assumption,
            });
        }

        self.values.insert(variable.key, sourced);
    }

    /// Documents first, then one web search. `Ok(Err)` lists what went wrong.
    fn retrieve(
        &mut self,
        variable: &Variable,
        transcript: &[TranscriptEntry],
        phrasing: Phrasing,
    ) -> Progress<std::result::Result<Sourced, Vec<String>>> {
        let queries = phrasing.context_queries(variable);
        let mut problems = match lookup(transcript, ToolKind::ContextSearch, &queries, |r| {
            figure_in(r, variable).is_some()
        })? {
            Lookup::Found { ordinal, result } => {
                return Ok(Ok(Sourced {
                    value: figure_in(result, variable).map(|(value, _)| value),
                    citations: vec![ordinal],
                    assumption: None,
                }))
            }
            Lookup::Exhausted(problems) => problems,
        };

        let web = lookup(
            transcript,
            ToolKind::WebSearch,
            &[phrasing.web_query(variable)],
            |r| figure_in(r, variable).is_some(),
        )?;

        match web {
            Lookup::Found { ordinal, result } => {
                let Some((value, item)) = figure_in(result, variable) else {
                    return Ok(Err(problems));
                };
                let index = self.assume(
                    format!(
                        "{} of {} taken from a public source, not the documents",
                        variable.label, value
                    ),
                    format!("{}; found in {}", problems.join("; "), item.source),
                    ConfidenceLevel::Medium,
                );
                Ok(Ok(Sourced {
                    value: Some(value),
                    citations: vec![ordinal],
                    assumption: Some(index),
                }))
            }
            Lookup::Exhausted(more) => {
                problems.extend(more);
                Ok(Err(problems))
            }
        }
    }

    /// Low-confidence stand-in for a figure no tool supplied
    fn stand_in(&mut self, variable: &Variable, problems: Vec<String>) -> Sourced {
        let basis = variable.proxy.and_then(|proxy| {
            self.values
                .get(proxy.basis)
                .and_then(|b| b.value.map(|value| (proxy, value, b.citations.clone())))
        });

        match basis {
            Some((proxy, basis_value, citations)) => {
                let value = basis_value * proxy.factor;
                let index = self.assume(
                    format!(
                        "{} unavailable; approximated as {} x {} = {}",
                        variable.label, proxy.factor, proxy.basis, value
                    ),
                    format!("{}; {}", proxy.justification, problems.join("; ")),
                    ConfidenceLevel::Low,
                );
                Sourced {
                    value: Some(value),
                    citations,
                    assumption: Some(index),
                }
            }
            None => {
                let index = self.assume(
                    format!("{} could not be sourced", variable.label),
                    problems.join("; "),
                    ConfidenceLevel::Low,
                );
                Sourced {
                    value: None,
                    citations: vec![],
                    assumption: Some(index),
                }
            }
        }
    }

    fn estimate(
        &mut self,
        variable: &Variable,
        transcript: &[TranscriptEntry],
        query: &str,
        fallback: f64,
        justification: &str,
    ) -> Progress<Sourced> {
        let found = lookup(
            transcript,
            ToolKind::WebSearch,
            &[query.to_string()],
            |r| figure_in(r, variable).is_some(),
        )?;

        let benchmark = match found {
            Lookup::Found { ordinal, result } => figure_in(result, variable)
                .map(|(value, item)| (value, ordinal, item.source.clone()))
                .ok_or_else(Vec::new),
            Lookup::Exhausted(problems) => Err(problems),
        };

        Ok(match benchmark {
            Ok((value, ordinal, source)) => {
                let index = self.assume(
                    format!(
                        "{} estimated at {} from a public benchmark",
                        variable.label, value
                    ),
                    format!("{} ({})", justification, source),
                    ConfidenceLevel::Medium,
                );
                Sourced {
                    value: Some(value),
                    citations: vec![ordinal],
                    assumption: Some(index),
                }
            }
            Err(problems) => {
                let index = self.assume(
                    format!("{} set to fallback value {}", variable.label, fallback),
                    format!(
                        "{}; benchmark search unavailable: {}",
                        justification,
                        problems.join("; ")
                    ),
                    ConfidenceLevel::Low,
                );
                Sourced {
                    value: Some(fallback),
                    citations: vec![],
                    assumption: Some(index),
                }
            }
        })
    }

    /// Evaluate the metric's derivations in order, one step each
    fn derive(&mut self, metric: &Metric, support: &BTreeMap<&str, FormulaSupport>) {
        for derivation in metric.derivations {
            let mut inputs = BTreeMap::new();
            let mut operands = Vec::with_capacity(derivation.operands.len());
            let mut citations = Vec::new();
            let mut assumption = None;

            for key in derivation.operands {
                let sourced = self.values.get(key).cloned().unwrap_or_default();
                inputs.insert(key.to_string(), value_or_unavailable(sourced.value));
                operands.push(sourced.value);
                citations.extend(sourced.citations);
                assumption = assumption.or(sourced.assumption);
            }

            match support.get(derivation.key) {
                Some(FormulaSupport::Cited(ordinal)) => citations.push(*ordinal),
                Some(FormulaSupport::Assumed(index)) => assumption = assumption.or(Some(*index)),
                None => {}
            }
            citations.sort_unstable();
            citations.dedup();

            let value = operands
                .into_iter()
                .collect::<Option<Vec<f64>>>()
                .and_then(|ops| derivation.operation.apply(&ops));

            let verb = if metric.derivation_uses_estimate(derivation) {
                "Estimate"
            } else {
                "Compute"
            };

            self.steps.push(StepDraft {
                description: format!("{} {}", verb, derivation.label),
                formula: Some(derivation.formula.to_string()),
                inputs,
                result: value_or_unavailable(value),
                citations: citations.clone(),
                assumption,
            });
            self.values.insert(
                derivation.key,
                Sourced {
                    value,
                    citations,
                    assumption,
                },
            );
        }
    }

    fn apply_adjustment(&mut self, metric: &Metric) {
        if let Some((description, justification)) = metric.adjustment {
            let index = self.assume(
                description.to_string(),
                justification.to_string(),
                ConfidenceLevel::Medium,
            );
            if let Some(last) = self.steps.last_mut() {
                last.assumption = last.assumption.or(Some(index));
            }
        }
    }
}

//
// ================= Phases =================
//

fn classify(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let question = request.question;
    let hint = QuestionClassifier::hint(question);

    if hint == Category::Conceptual {
        return Ok(json!({
            "category": Category::Conceptual,
            "rationale": "Definitional question; no numeric computation requested",
        }));
    }

    let Some(metric) = catalog::find_metric(&question.text) else {
        return Ok(json!({
            "category": Category::TacticalAssumptionBased,
            "rationale": "Numeric request without a standard formula; inputs must be assumed",
        }));
    };

    let mut missing = Vec::new();
    for variable in metric.variables.iter().filter(|v| !v.is_estimate()) {
        if catalog::extract_figure(&question.text, variable).is_some() {
            continue;
        }
        let found = lookup(
            request.transcript,
            ToolKind::ContextSearch,
            &[variable.label.to_string()],
            |r| figure_in(r, variable).is_some(),
        )?;
        if let Lookup::Exhausted(_) = found {
            missing.push(variable.label);
        }
    }

    let (category, rationale) = if !missing.is_empty() {
        (
            Category::TacticalAssumptionBased,
            format!(
                "The {} needs {} which the documents do not state",
                metric.name,
                missing.join(", ")
            ),
        )
    } else if metric.requires_assumptions() || hint == Category::TacticalAssumptionBased {
        (
            Category::TacticalAssumptionBased,
            format!(
                "The {} depends on estimates or judgment beyond the stated figures",
                metric.name
            ),
        )
    } else {
        (
            Category::TacticalBasic,
            format!(
                "The {} is a standard formula over stated or retrievable figures",
                metric.name
            ),
        )
    };

    Ok(json!({ "category": category, "rationale": rationale }))
}

fn direct(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let metric = catalog::find_metric(&request.question.text);
    let Some((metric, result)) = metric.and_then(|m| m.result().map(|r| (m, r))) else {
        return Ok(json!({ "steps": [], "final_value": null, "assumptions": [] }));
    };

    let mut workbook = Workbook::default();

    let formula = lookup(
        request.transcript,
        ToolKind::WebSearch,
        &[result.reference_query.to_string()],
        has_items,
    )?;
    let support = match formula {
        Lookup::Found { ordinal, .. } => FormulaSupport::Cited(ordinal),
        Lookup::Exhausted(problems) => FormulaSupport::Assumed(workbook.assume(
            format!(
                "Standard {} formula applied without external confirmation",
                metric.name
            ),
            problems.join("; "),
            ConfidenceLevel::Medium,
        )),
    };

    workbook.source_variables(
        metric,
        request.question,
        request.transcript,
        Phrasing::Primary,
        false,
    )?;

    let support: BTreeMap<&str, FormulaSupport> = metric
        .derivations
        .iter()
        .map(|d| (d.key, support))
        .collect();
    workbook.derive(metric, &support);

    Ok(json!({
        "steps": workbook.steps,
        "final_value": workbook.final_value(metric),
        "assumptions": workbook.assumptions,
    }))
}

fn plan(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let Some(metric) = catalog::find_metric(&request.question.text) else {
        return Ok(json!({ "steps": [] }));
    };

    let mut steps = Vec::new();

    for variable in metric.variables {
        if catalog::extract_figure(&request.question.text, variable).is_some() {
            continue;
        }
        let description = if variable.is_estimate() {
            format!("Estimate {} from a public benchmark", variable.label)
        } else {
            format!("Retrieve {} from the documents", variable.label)
        };
        steps.push(PlannedStep {
            name: variable.key.to_string(),
            description,
            formula: None,
            validation: None,
        });
    }

    for derivation in metric.derivations {
        let found = lookup(
            request.transcript,
            ToolKind::WebSearch,
            &[derivation.reference_query.to_string()],
            has_items,
        )?;
        let validation = match found {
            Lookup::Found { ordinal, .. } => FormulaValidation::Confirmed { citation: ordinal },
            Lookup::Exhausted(problems) => FormulaValidation::UnconfirmedAssumption {
                justification: format!(
                    "Reference search unavailable ({}); textbook definition retained",
                    problems.join("; ")
                ),
            },
        };

        let verb = if metric.derivation_uses_estimate(derivation) {
            "Estimate"
        } else {
            "Compute"
        };
        steps.push(PlannedStep {
            name: derivation.key.to_string(),
            description: format!("{} {}", verb, derivation.label),
            formula: Some(derivation.formula.to_string()),
            validation: Some(validation),
        });
    }

    Ok(json!({ "steps": steps }))
}

fn execute(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let Some(metric) = catalog::find_metric(&request.question.text) else {
        return Ok(json!({ "steps": [], "assumptions": [] }));
    };

    let plan: Vec<PlannedStep> = request.handoff("plan").unwrap_or_default();
    let mut workbook = Workbook::default();

    workbook.source_variables(
        metric,
        request.question,
        request.transcript,
        Phrasing::Primary,
        true,
    )?;

    let mut support = BTreeMap::new();
    for step in &plan {
        let Some(derivation) = metric.derivations.iter().find(|d| d.key == step.name) else {
            continue;
        };
        let entry = match &step.validation {
            Some(FormulaValidation::Confirmed { citation }) => FormulaSupport::Cited(*citation),
            Some(FormulaValidation::UnconfirmedAssumption { justification }) => {
                FormulaSupport::Assumed(workbook.assume(
                    format!(
                        "Formula '{}' used without external confirmation",
                        derivation.formula
                    ),
                    justification.clone(),
                    ConfidenceLevel::Medium,
                ))
            }
            _ => continue,
        };
        support.insert(derivation.key, entry);
    }

    workbook.derive(metric, &support);
    workbook.apply_adjustment(metric);

    Ok(json!({
        "steps": workbook.steps,
        "assumptions": workbook.assumptions,
    }))
}

fn finalize(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let steps: Vec<StepDraft> = request.handoff("steps").unwrap_or_default();
    let final_value = steps.last().and_then(|s| s.result.as_number());

    Ok(json!({ "final_value": final_value, "assumptions": [] }))
}

fn explain(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let term = catalog::concept_term(&request.question.text);
    let sub_category = if QuestionClassifier::is_definitional(&request.question.text) {
        "definition"
    } else {
        "scenario"
    };

    let mut definitions = Vec::new();

    if !term.is_empty() {
        let context = lookup(
            request.transcript,
            ToolKind::ContextSearch,
            &[term.clone()],
            has_items,
        )?;
        if let Lookup::Found { ordinal, result } = context {
            if let Some(item) = result
                .items
                .iter()
                .find(|i| catalog::normalize(&i.text).contains(&term))
            {
                definitions.push(Definition {
                    term: term.clone(),
                    text: item.text.clone(),
                    citations: vec![ordinal],
                });
            }
        }

        let web = lookup(
            request.transcript,
            ToolKind::WebSearch,
            &[format!("{} definition", term)],
            has_items,
        )?;
        if let Lookup::Found { ordinal, result } = web {
            if let Some(item) = result.items.first() {
                definitions.push(Definition {
                    term: term.clone(),
                    text: item.text.clone(),
                    citations: vec![ordinal],
                });
            }
        }
    }

    let explanation = if definitions.is_empty() {
        format!("No authoritative definition of '{}' could be retrieved.", term)
    } else {
        definitions
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };

    Ok(json!({
        "explanation": explanation,
        "definitions": definitions,
        "sub_category": sub_category,
    }))
}

fn review(request: &ReasoningRequest<'_>) -> Progress<Value> {
    let question = request.question;

    let Some(target) = request.handoff::<AgentResult>("specialist_result") else {
        let finding = Finding {
            severity: Severity::Critical,
            description: "No specialist result was handed to the critic".to_string(),
        };
        return Ok(json!({
            "verdict": Verdict::Reject,
            "findings": [finding],
            "rederived_value": null,
        }));
    };

    if target.role == AgentRole::Conceptual {
        return review_explanation(request, &target);
    }

    let metric = catalog::find_metric(&question.text);
    let check_query = match metric {
        Some(m) => format!("{} formula verification", m.name),
        None => format!("{} verification", question.text.trim()),
    };

    let mut findings = Vec::new();

    let formula_check = lookup(
        request.transcript,
        ToolKind::WebSearch,
        &[check_query],
        has_items,
    )?;
    if let Lookup::Exhausted(problems) = formula_check {
        findings.push(Finding {
            severity: Severity::Warning,
            description: format!(
                "Formula could not be independently checked: {}",
                problems.join("; ")
            ),
        });
    }

    let rederived = match metric {
        Some(metric) => {
            let mut workbook = Workbook::default();
            workbook.source_variables(
                metric,
                question,
                request.transcript,
                Phrasing::Independent,
                false,
            )?;
            workbook.derive(metric, &BTreeMap::new());
            workbook.final_value(metric)
        }
        None => None,
    };

    for assumption in &target.assumptions {
        let severity = if assumption.confidence == ConfidenceLevel::Low {
            Severity::Warning
        } else {
            Severity::Info
        };
        findings.push(Finding {
            severity,
            description: format!(
                "Relies on assumption: {} ({} confidence)",
                assumption.description, assumption.confidence
            ),
        });
    }

    let verdict = match (target.final_value, rederived) {
        (None, _) => {
            findings.push(Finding {
                severity: Severity::Critical,
                description: "Specialist produced no final value".to_string(),
            });
            Verdict::Reject
        }
        (Some(_), None) => {
            findings.push(Finding {
                severity: Severity::Warning,
                description: "The figure could not be independently re-derived".to_string(),
            });
            Verdict::Revise
        }
        (Some(reported), Some(check)) => {
            let deviation = (reported - check).abs() / check.abs().max(f64::EPSILON);
            if deviation <= AGREEMENT_TOLERANCE {
                findings.push(Finding {
                    severity: Severity::Info,
                    description: format!("Independent re-derivation agrees: {:.4}", check),
                });
                Verdict::Approved
            } else {
                findings.push(Finding {
                    severity: Severity::Critical,
                    description: format!(
                        "Re-derived {:.4} differs from reported {:.4} ({:.1}%)",
                        check,
                        reported,
                        deviation * 100.0
                    ),
                });
                if deviation <= REJECT_TOLERANCE {
                    Verdict::Revise
                } else {
                    Verdict::Reject
                }
            }
        }
    };

    Ok(json!({
        "verdict": verdict,
        "findings": findings,
        "rederived_value": rederived,
    }))
}

fn review_explanation(request: &ReasoningRequest<'_>, target: &AgentResult) -> Progress<Value> {
    let term = catalog::concept_term(&request.question.text);
    let cited = match &target.payload {
        crate::models::RolePayload::Conceptual { definitions, .. } => {
            definitions.iter().any(|d| !d.citations.is_empty())
        }
        _ => false,
    };

    let found = lookup(
        request.transcript,
        ToolKind::WebSearch,
        &[format!("{} meaning", term)],
        has_items,
    )?;

    let (verdict, finding) = match found {
        Lookup::Found { .. } if cited => (
            Verdict::Approved,
            Finding {
                severity: Severity::Info,
                description: "Definition corroborated by an independent reference".to_string(),
            },
        ),
        Lookup::Found { .. } => (
            Verdict::Revise,
            Finding {
                severity: Severity::Warning,
                description: "An independent reference exists but the explanation cites no definition"
                    .to_string(),
            },
        ),
        Lookup::Exhausted(problems) => (
            Verdict::Revise,
            Finding {
                severity: Severity::Warning,
                description: format!(
                    "Could not corroborate the definition: {}",
                    problems.join("; ")
                ),
            },
        ),
    };

    Ok(json!({
        "verdict": verdict,
        "findings": [finding],
        "rederived_value": null,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextSearchOptions, ToolOptions, WebSearchOptions};
    use crate::tools::{StaticContextTool, StaticWebTool, ToolBackend, SAMPLE_CONTEXT};

    /// Runs one phase to completion against the offline backends
    async fn run_phase(
        role: AgentRole,
        phase: Phase,
        question: &Question,
        handoff: Option<Value>,
    ) -> (Value, Vec<TranscriptEntry>) {
        run_phase_over(SAMPLE_CONTEXT, role, phase, question, handoff).await
    }

    async fn run_phase_over(
        document: &str,
        role: AgentRole,
        phase: Phase,
        question: &Question,
        handoff: Option<Value>,
    ) -> (Value, Vec<TranscriptEntry>) {
        let reasoner = RuleBasedReasoner::new();
        let context = StaticContextTool::from_document("context", document);
        let web = StaticWebTool::with_reference_entries();
        let mut transcript = Vec::new();
        let mut ordinal = 100;

        for _ in 0..20 {
            let request = ReasoningRequest {
                role,
                phase,
                instructions: "",
                question,
                handoff_context: handoff.as_ref(),
                notes: &[],
                transcript: &transcript,
            };
            match reasoner.next_turn(&request).await.unwrap() {
                ReasoningTurn::Complete { output } => return (output, transcript),
                ReasoningTurn::InvokeTool { tool, query, .. } => {
                    ordinal += 1;
                    let result = match tool {
                        ToolKind::ContextSearch => context
                            .search(
                                &query,
                                &ToolOptions::ContextSearch(ContextSearchOptions::default()),
                            )
                            .await
                            .unwrap(),
                        ToolKind::WebSearch => web
                            .search(&query, &ToolOptions::WebSearch(WebSearchOptions::default()))
                            .await
                            .unwrap(),
                    };
                    transcript.push(TranscriptEntry::ToolResponse {
                        ordinal,
                        tool,
                        query,
                        result,
                    });
                }
            }
        }
        panic!("phase did not complete");
    }

    #[tokio::test]
    async fn test_router_uses_given_figures_without_tools() {
        let question = Question::new(
            "Calculate the current ratio given current assets = 1000 and current liabilities = 400",
        );
        let (output, transcript) =
            run_phase(AgentRole::Router, Phase::Classify, &question, None).await;

        assert_eq!(output["category"], "tactical_basic");
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn test_router_confirms_context_for_retrieved_figures() {
        let question = Question::new("What is Gross Profit in the year ending 2024?");
        let (output, transcript) =
            run_phase(AgentRole::Router, Phase::Classify, &question, None).await;

        assert_eq!(output["category"], "tactical_basic");
        assert_eq!(transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_direct_current_ratio() {
        let question = Question::new(
            "Calculate the current ratio given current assets = 1000 and current liabilities = 400",
        );
        let (output, transcript) = run_phase(AgentRole::Basic, Phase::Direct, &question, None).await;

        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].tool(), ToolKind::WebSearch);
        assert_eq!(output["final_value"], 2.5);

        let steps: Vec<StepDraft> = serde_json::from_value(output["steps"].clone()).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].citations, vec![101]);
        assert!(steps[0].assumption.is_none());
    }

    #[tokio::test]
    async fn test_plan_and_execute_market_leverage() {
        let question = Question::new("Estimate market debt-to-equity ratio");
        let (plan, _) = run_phase(AgentRole::AssumptionBased, Phase::Plan, &question, None).await;

        let planned: Vec<PlannedStep> = serde_json::from_value(plan["steps"].clone()).unwrap();
        assert!(planned.iter().any(|s| s.name == "market_equity"));
        assert!(planned
            .iter()
            .filter(|s| s.formula.is_some())
            .all(|s| matches!(s.validation, Some(FormulaValidation::Confirmed { .. }))));

        let handoff = json!({ "plan": planned });
        let (executed, _) = run_phase(
            AgentRole::AssumptionBased,
            Phase::Execute,
            &question,
            Some(handoff),
        )
        .await;

        let steps: Vec<StepDraft> = serde_json::from_value(executed["steps"].clone()).unwrap();
        let assumptions: Vec<Assumption> =
            serde_json::from_value(executed["assumptions"].clone()).unwrap();
        let last = steps.last().unwrap().result.as_number().unwrap();

        assert!((last - 5897.0 / (4300.0 * 3.0)).abs() < 1e-9);
        assert_eq!(assumptions.len(), 1);
        assert_eq!(assumptions[0].confidence, ConfidenceLevel::Medium);
    }

    #[tokio::test]
    async fn test_missing_document_figure_falls_back_to_proxy() {
        let document: String = SAMPLE_CONTEXT
            .lines()
            .filter(|line| !line.to_lowercase().contains("debt"))
            .collect::<Vec<_>>()
            .join("\n");
        let question = Question::new("Estimate market debt-to-equity ratio");
        let (plan, _) = run_phase_over(
            &document,
            AgentRole::AssumptionBased,
            Phase::Plan,
            &question,
            None,
        )
        .await;

        let (executed, transcript) = run_phase_over(
            &document,
            AgentRole::AssumptionBased,
            Phase::Execute,
            &question,
            Some(json!({ "plan": plan["steps"] })),
        )
        .await;

        // Documents, then one reformulated web search
        assert!(transcript
            .iter()
            .any(|e| e.matches(ToolKind::WebSearch, "total debt latest annual report")));

        let steps: Vec<StepDraft> = serde_json::from_value(executed["steps"].clone()).unwrap();
        let assumptions: Vec<Assumption> =
            serde_json::from_value(executed["assumptions"].clone()).unwrap();

        let debt_step = steps
            .iter()
            .find(|s| s.description == "Estimate total debt")
            .unwrap();
        assert_eq!(debt_step.result.as_number(), Some(2150.0));
        assert!(!debt_step.citations.is_empty());

        let proxy = &assumptions[debt_step.assumption.unwrap()];
        assert_eq!(proxy.confidence, ConfidenceLevel::Low);
        assert!(proxy.description.contains("total debt unavailable"));

        let last = steps.last().unwrap().result.as_number().unwrap();
        assert!((last - 2150.0 / (4300.0 * 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_explain_cites_definition() {
        let question = Question::new("What is EBITDA?");
        let (output, _) =
            run_phase(AgentRole::Conceptual, Phase::Explain, &question, None).await;

        let definitions: Vec<Definition> =
            serde_json::from_value(output["definitions"].clone()).unwrap();
        assert!(!definitions.is_empty());
        assert!(definitions.iter().all(|d| !d.citations.is_empty()));
        assert_eq!(output["sub_category"], "definition");
    }

    #[tokio::test]
    async fn test_unknown_role_phase_pair_is_error() {
        let question = Question::new("What is EBITDA?");
        let request = ReasoningRequest {
            role: AgentRole::Critic,
            phase: Phase::Plan,
            instructions: "",
            question: &question,
            handoff_context: None,
            notes: &[],
            transcript: &[],
        };
        assert!(RuleBasedReasoner::new().next_turn(&request).await.is_err());
    }
}
