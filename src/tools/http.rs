//! HTTP-backed tools
//!
//! Context search calls the document retrieval service; web search goes
//! through Gemini.

use super::ToolBackend;
use crate::error::OrchestrationError;
use crate::gemini::GeminiClient;
use crate::models::{ToolItem, ToolKind, ToolOptions, ToolResult};
use crate::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const CONTEXT_SEARCH_PATH: &str = "/api/v1/context/search";

#[derive(Debug, Deserialize)]
struct ContextSearchResponse {
    #[serde(default)]
    results: Vec<ToolItem>,
    #[serde(default)]
    truncated: bool,
}

/// Context search against the configured retrieval service
pub struct ContextSearchHttpTool {
    client: Client,
    base_url: String,
    vector_store_id: Option<String>,
}

impl ContextSearchHttpTool {
    pub fn new(base_url: &str, vector_store_id: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            vector_store_id,
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(ToolKind::ContextSearch, path, e))?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::ToolUnavailable {
                tool: ToolKind::ContextSearch,
                reason: format!("Invalid JSON response: {}", e),
            })?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolUnavailable {
                tool: ToolKind::ContextSearch,
                reason: format!("Service returned {} for {}: {}", status, path, body),
            });
        }

        Ok(body)
    }
}

fn request_error(tool: ToolKind, path: &str, e: reqwest::Error) -> OrchestrationError {
    if e.is_timeout() {
        OrchestrationError::ToolTimeout {
            tool,
            after_ms: None,
        }
    } else {
        OrchestrationError::ToolUnavailable {
            tool,
            reason: format!("Request failed for {}: {}", path, e),
        }
    }
}

#[async_trait::async_trait]
impl ToolBackend for ContextSearchHttpTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ContextSearch
    }

    fn description(&self) -> &'static str {
        "Search the question's source documents via /api/v1/context/search"
    }

    async fn search(&self, query: &str, options: &ToolOptions) -> Result<ToolResult> {
        let ToolOptions::ContextSearch(options) = options else {
            return Err(OrchestrationError::InvalidToolInput(
                "context search requires context search options".to_string(),
            ));
        };

        let body = json!({
            "query": query,
            "vector_store_id": self.vector_store_id,
            "max_results": options.max_results,
            "include_raw_text": options.include_raw_text,
            "filter": options.filter,
        });

        let response = self.post_json(CONTEXT_SEARCH_PATH, &body).await?;
        let parsed: ContextSearchResponse = serde_json::from_value(response).map_err(|e| {
            OrchestrationError::ToolUnavailable {
                tool: ToolKind::ContextSearch,
                reason: format!("Unexpected response shape: {}", e),
            }
        })?;

        let truncated = parsed.truncated || parsed.results.len() > options.max_results;
        let items = parsed.results.into_iter().take(options.max_results).collect();

        Ok(ToolResult { items, truncated })
    }
}

/// Web search answered by Gemini
pub struct GeminiWebSearchTool {
    client: GeminiClient,
}

impl GeminiWebSearchTool {
    const SYSTEM_PREFIX: &'static str = "You are a financial reference search engine. \
        Answer with short factual snippets, one per line, each with its figure or \
        definition. Do not speculate.";

    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ToolBackend for GeminiWebSearchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::WebSearch
    }

    fn description(&self) -> &'static str {
        "Public reference search for formulas, definitions and market figures"
    }

    async fn search(&self, query: &str, options: &ToolOptions) -> Result<ToolResult> {
        let ToolOptions::WebSearch(options) = options else {
            return Err(OrchestrationError::InvalidToolInput(
                "web search requires web search options".to_string(),
            ));
        };

        let prompt = match options.locale.as_deref() {
            Some(locale) => format!("Locale: {}\nQuery: {}", locale, query),
            None => format!("Query: {}", query),
        };

        let (answer, confidence) = self
            .client
            .generate(Self::SYSTEM_PREFIX, &prompt)
            .await
            .map_err(|e| OrchestrationError::ToolUnavailable {
                tool: ToolKind::WebSearch,
                reason: e.to_string(),
            })?;

        let limit = options.result_depth.item_limit();
        let lines: Vec<&str> = answer
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
            .filter(|l| !l.is_empty())
            .collect();

        let items = lines
            .iter()
            .take(limit)
            .map(|line| ToolItem {
                source: "gemini:web".to_string(),
                text: line.to_string(),
                score: Some(confidence),
            })
            .collect();

        Ok(ToolResult {
            items,
            truncated: lines.len() > limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextSearchOptions;

    #[test]
    fn test_response_shape_parses() {
        let parsed: ContextSearchResponse = serde_json::from_value(json!({
            "results": [
                { "source": "10-K#p4", "text": "Total current assets: 3,800", "score": 0.91 }
            ]
        }))
        .unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(!parsed.truncated);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_tool_failure() {
        let tool = ContextSearchHttpTool::new("http://127.0.0.1:9", None).unwrap();
        let options = ToolOptions::ContextSearch(ContextSearchOptions::default());

        let err = tool.search("current assets", &options).await.unwrap_err();
        assert!(err.is_tool_failure());
    }
}
