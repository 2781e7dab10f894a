//! Tool gateway
//!
//! Uniform interface over the two retrieval capabilities. The gateway is
//! stateless and shared read-only across questions; every call, successful
//! or not, is appended to the calling question's provenance recorder before
//! control returns. No retries happen here.

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::gemini::GeminiClient;
use crate::models::{Stage, ToolKind, ToolOptions, ToolResult};
use crate::provenance::{InvocationRecord, ProvenanceRecorder};
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod corpus;
pub mod http;

pub use corpus::{FailureInjectingTool, FailureMode, StaticContextTool, StaticWebTool};
pub use http::{ContextSearchHttpTool, GeminiWebSearchTool};

/// Sample filing used when no context search service is configured
pub const SAMPLE_CONTEXT: &str = include_str!("../../data/context.txt");

/// A retrieval backend for one tool kind
#[async_trait::async_trait]
pub trait ToolBackend: Send + Sync {
    fn kind(&self) -> ToolKind;
    fn description(&self) -> &'static str;
    async fn search(&self, query: &str, options: &ToolOptions) -> Result<ToolResult>;
}

/// A registered backend as listed to callers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub tool: ToolKind,
    pub description: &'static str,
}

/// Gateway over registered backends, keyed by tool kind
pub struct ToolGateway {
    backends: HashMap<ToolKind, Arc<dyn ToolBackend>>,
}

impl ToolGateway {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, backend: Arc<dyn ToolBackend>) {
        debug!(
            tool = %backend.kind(),
            description = backend.description(),
            "Registered tool backend"
        );
        self.backends.insert(backend.kind(), backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn has(&self, kind: ToolKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered backends, ordered by tool name
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .backends
            .iter()
            .map(|(kind, backend)| ToolDescriptor {
                tool: *kind,
                description: backend.description(),
            })
            .collect();
        tools.sort_by_key(|t| t.tool.as_str());
        tools
    }

    /// Invoke a tool and record the outcome for the active question
    pub async fn invoke(
        &self,
        kind: ToolKind,
        query: &str,
        options: &ToolOptions,
        stage: Stage,
        recorder: &mut ProvenanceRecorder,
    ) -> Result<ToolResult> {
        let start = Instant::now();
        let outcome = self.dispatch(kind, query, options).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let ordinal = match &outcome {
            Ok(result) => recorder.record_invocation(InvocationRecord {
                stage,
                tool: kind,
                query,
                options,
                outcome: Ok(result),
                latency_ms,
            }),
            Err(e) => {
                warn!(
                    question_id = %recorder.question_id(),
                    tool = %kind,
                    query = %query,
                    error = %e,
                    "Tool invocation failed"
                );
                recorder.record_invocation(InvocationRecord {
                    stage,
                    tool: kind,
                    query,
                    options,
                    outcome: Err(e.to_string()),
                    latency_ms,
                })
            }
        };

        debug!(ordinal, tool = %kind, latency_ms, "Tool invocation complete");

        outcome
    }

    async fn dispatch(
        &self,
        kind: ToolKind,
        query: &str,
        options: &ToolOptions,
    ) -> Result<ToolResult> {
        if options.kind() != kind {
            return Err(OrchestrationError::InvalidToolInput(format!(
                "{} options passed to {}",
                options.kind(),
                kind
            )));
        }

        if query.trim().is_empty() {
            return Err(OrchestrationError::InvalidToolInput(format!(
                "Empty query for {}",
                kind
            )));
        }

        let backend = self
            .backends
            .get(&kind)
            .ok_or_else(|| OrchestrationError::ToolUnavailable {
                tool: kind,
                reason: "no backend registered".to_string(),
            })?;

        match options.timeout_ms() {
            Some(ms) => {
                tokio::time::timeout(Duration::from_millis(ms), backend.search(query, options))
                    .await
                    .map_err(|_| OrchestrationError::ToolTimeout {
                        tool: kind,
                        after_ms: Some(ms),
                    })?
            }
            None => backend.search(query, options).await,
        }
    }
}

impl Default for ToolGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the gateway described by the configuration.
///
/// Context search goes to the configured HTTP service, falling back to the
/// bundled sample filing. Web search goes through Gemini when a key is
/// present, otherwise to the static reference entries.
pub fn create_default_gateway(config: &OrchestratorConfig) -> Result<ToolGateway> {
    let mut gateway = ToolGateway::new();

    match config.tools.context_search_url.as_deref() {
        Some(url) => gateway.register(Arc::new(ContextSearchHttpTool::new(
            url,
            config.tools.vector_store_id.clone(),
        )?)),
        None => gateway.register(Arc::new(StaticContextTool::from_document(
            "context",
            SAMPLE_CONTEXT,
        ))),
    }

    match config.reasoning.api_key.as_deref() {
        Some(key) if !key.is_empty() => gateway.register(Arc::new(GeminiWebSearchTool::new(
            GeminiClient::new(key.to_string(), &config.reasoning.model),
        ))),
        _ => gateway.register(Arc::new(StaticWebTool::with_reference_entries())),
    }

    Ok(gateway)
}
