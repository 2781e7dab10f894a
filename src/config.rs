//! Orchestrator configuration
//!
//! Passed explicitly at construction. `from_env` reads `.env` and
//! `FINANCIAL_*` variables for the binaries; the core never reads globals.

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::error::OrchestrationError;
use crate::models::{Category, ContextSearchOptions, ResultDepth, WebSearchOptions};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningProvider {
    Gemini,
    #[default]
    RuleBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub provider: ReasoningProvider,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: ReasoningProvider::RuleBased,
            model: "gemini-2.0-flash".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Base URL of the context search service; static corpus when absent
    pub context_search_url: Option<String>,
    pub vector_store_id: Option<String>,
    pub max_results: usize,
    pub include_raw_text: bool,
    pub locale: Option<String>,
    pub result_depth: ResultDepth,
    /// Per-invocation timeout applied to default options
    pub timeout_ms: Option<u64>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            context_search_url: None,
            vector_store_id: None,
            max_results: 5,
            include_raw_text: true,
            locale: None,
            result_depth: ResultDepth::Medium,
            timeout_ms: None,
        }
    }
}

impl ToolConfig {
    pub fn context_search_defaults(&self) -> ContextSearchOptions {
        ContextSearchOptions {
            max_results: self.max_results,
            include_raw_text: self.include_raw_text,
            filter: None,
            timeout_ms: self.timeout_ms,
        }
    }

    pub fn web_search_defaults(&self) -> WebSearchOptions {
        WebSearchOptions {
            locale: self.locale.clone(),
            result_depth: self.result_depth,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// When the critic reviews a category's specialist output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CriticMode {
    Never,
    Always,
    WhenNotHigh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticPolicy {
    pub tactical_basic: CriticMode,
    pub tactical_assumption_based: CriticMode,
    pub conceptual: CriticMode,
}

impl Default for CriticPolicy {
    fn default() -> Self {
        Self {
            tactical_basic: CriticMode::Never,
            tactical_assumption_based: CriticMode::Always,
            conceptual: CriticMode::Never,
        }
    }
}

impl CriticPolicy {
    pub fn mode_for(&self, category: Category) -> CriticMode {
        match category {
            Category::TacticalBasic => self.tactical_basic,
            Category::TacticalAssumptionBased => self.tactical_assumption_based,
            Category::Conceptual => self.conceptual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Reasoning turns allowed in one session before it is abandoned
    pub max_turns: usize,
    /// Failed tool calls tolerated per session before tool requests are refused
    pub max_tool_failures: usize,
    /// Plan revision rounds when a formula fails validation
    pub max_plan_revisions: u32,
    /// Web searches the basic specialist may issue
    pub basic_web_search_budget: usize,
    pub critic: CriticPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_turns: 16,
            max_tool_failures: 3,
            max_plan_revisions: 2,
            basic_web_search_budget: 1,
            critic: CriticPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub reasoning: ReasoningConfig,
    pub tools: ToolConfig,
    pub policy: PolicyConfig,
    /// Questions processed concurrently
    pub concurrency_limit: usize,
    /// Whole-pipeline deadline; none by default
    pub pipeline_deadline_ms: Option<u64>,
    /// Finished results kept in the audit log before the oldest is evicted
    pub audit_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reasoning: ReasoningConfig::default(),
            tools: ToolConfig::default(),
            policy: PolicyConfig::default(),
            concurrency_limit: 4,
            pipeline_deadline_ms: None,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Load from `.env` and the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                config.reasoning.api_key = Some(key);
                config.reasoning.provider = ReasoningProvider::Gemini;
            }
        }
        if let Ok(provider) = env::var("FINANCIAL_REASONING_PROVIDER") {
            config.reasoning.provider = match provider.to_lowercase().as_str() {
                "gemini" => ReasoningProvider::Gemini,
                "rule_based" | "rule-based" | "offline" => ReasoningProvider::RuleBased,
                other => {
                    return Err(OrchestrationError::ConfigError(format!(
                        "Unknown reasoning provider '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(model) = env::var("FINANCIAL_REASONING_MODEL") {
            config.reasoning.model = model;
        }

        config.tools.context_search_url = env::var("FINANCIAL_CONTEXT_SEARCH_URL").ok();
        config.tools.vector_store_id = env::var("FINANCIAL_VECTOR_STORE_ID").ok();
        config.tools.locale = env::var("FINANCIAL_SEARCH_LOCALE").ok();
        if let Some(timeout) = parse_var::<u64>("FINANCIAL_TOOL_TIMEOUT_MS")? {
            config.tools.timeout_ms = Some(timeout);
        }
        if let Some(limit) = parse_var::<usize>("FINANCIAL_CONCURRENCY_LIMIT")? {
            config.concurrency_limit = limit;
        }
        if let Some(deadline) = parse_var::<u64>("FINANCIAL_PIPELINE_DEADLINE_MS")? {
            config.pipeline_deadline_ms = Some(deadline);
        }
        if let Some(capacity) = parse_var::<usize>("FINANCIAL_AUDIT_CAPACITY")? {
            config.audit_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(OrchestrationError::ConfigError(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.audit_capacity == 0 {
            return Err(OrchestrationError::ConfigError(
                "audit_capacity must be at least 1".to_string(),
            ));
        }
        if self.policy.max_turns == 0 {
            return Err(OrchestrationError::ConfigError(
                "policy.max_turns must be at least 1".to_string(),
            ));
        }
        if self.reasoning.provider == ReasoningProvider::Gemini
            && self.reasoning.api_key.as_deref().unwrap_or_default().is_empty()
        {
            return Err(OrchestrationError::ConfigError(
                "Gemini reasoning requires GEMINI_API_KEY".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::ConfigError(format!("{} is not a valid value: {}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.policy.critic.mode_for(Category::TacticalAssumptionBased),
            CriticMode::Always
        );
        assert_eq!(config.pipeline_deadline_ms, None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "concurrency_limit": 2,
            "policy": { "critic": { "conceptual": "always" } }
        }))
        .unwrap();
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.policy.max_turns, 16);
        assert_eq!(config.policy.critic.conceptual, CriticMode::Always);
        assert_eq!(config.policy.critic.tactical_basic, CriticMode::Never);
    }

    #[test]
    fn test_zero_audit_capacity_is_rejected() {
        let config = OrchestratorConfig {
            audit_capacity: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gemini_without_key_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.reasoning.provider = ReasoningProvider::Gemini;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = OrchestratorConfig::default();
        config.reasoning.api_key = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
