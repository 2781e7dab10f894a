//! Offline tool backends
//!
//! A line-indexed document corpus for context search, a keyword-indexed
//! reference table for web search, and a wrapper that injects failures.

use super::ToolBackend;
use crate::error::OrchestrationError;
use crate::models::{ToolItem, ToolKind, ToolOptions, ToolResult};
use crate::Result;
use std::sync::Arc;

const STOPWORDS: &[&str] = &[
    "the", "of", "and", "a", "an", "as", "for", "in", "to", "is", "what", "was", "its", "by",
    "on",
];

/// Share of query tokens a line must contain to be returned
const MIN_MATCH_SCORE: f32 = 0.6;

const SNIPPET_CHARS: usize = 160;

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
    {
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

#[derive(Debug, Clone)]
struct CorpusLine {
    source: String,
    text: String,
    tokens: Vec<String>,
}

/// Context search over an in-memory document, one entry per line
pub struct StaticContextTool {
    lines: Vec<CorpusLine>,
}

impl StaticContextTool {
    pub fn from_document(name: &str, document: &str) -> Self {
        let lines = document
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| CorpusLine {
                source: format!("{}#L{}", name, n + 1),
                text: line.trim().to_string(),
                tokens: tokenize(line),
            })
            .collect();
        Self { lines }
    }
}

#[async_trait::async_trait]
impl ToolBackend for StaticContextTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ContextSearch
    }

    fn description(&self) -> &'static str {
        "Keyword search over the bundled source document"
    }

    async fn search(&self, query: &str, options: &ToolOptions) -> Result<ToolResult> {
        let ToolOptions::ContextSearch(options) = options else {
            return Err(OrchestrationError::InvalidToolInput(
                "context search requires context search options".to_string(),
            ));
        };

        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(ToolResult::default());
        }

        let source_prefix = options
            .filter
            .as_ref()
            .and_then(|f| f.get("source"))
            .map(String::as_str);

        let mut scored: Vec<(f32, &CorpusLine)> = self
            .lines
            .iter()
            .filter(|line| source_prefix.map_or(true, |p| line.source.starts_with(p)))
            .filter_map(|line| {
                let hits = query_tokens
                    .iter()
                    .filter(|t| line.tokens.contains(t))
                    .count();
                let score = hits as f32 / query_tokens.len() as f32;
                (score >= MIN_MATCH_SCORE).then_some((score, line))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let truncated = scored.len() > options.max_results;
        let items = scored
            .into_iter()
            .take(options.max_results)
            .map(|(score, line)| ToolItem {
                source: line.source.clone(),
                text: if options.include_raw_text {
                    line.text.clone()
                } else {
                    line.text.chars().take(SNIPPET_CHARS).collect()
                },
                score: Some(score),
            })
            .collect();

        Ok(ToolResult { items, truncated })
    }
}

/// One reference entry: matched when any keyword phrase appears in the query
#[derive(Debug, Clone)]
pub struct ReferenceEntry {
    pub keywords: Vec<String>,
    pub source: String,
    pub text: String,
}

impl ReferenceEntry {
    pub fn new(keywords: &[&str], source: &str, text: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            source: source.to_string(),
            text: text.to_string(),
        }
    }
}

const REFERENCE_TABLE: &[(&[&str], &str, &str)] = &[
    (
        &["current ratio"],
        "reference:liquidity-ratios",
        "Current ratio = current assets / current liabilities. It measures a company's ability to cover short-term obligations.",
    ),
    (
        &["quick ratio", "acid test"],
        "reference:liquidity-ratios",
        "Quick ratio = (cash and cash equivalents + accounts receivable) / current liabilities. Inventory is excluded.",
    ),
    (
        &["gross profit"],
        "reference:income-statement",
        "Gross profit = revenue - cost of goods sold.",
    ),
    (
        &["gross margin"],
        "reference:income-statement",
        "Gross margin = gross profit / revenue, expressed as a fraction of sales.",
    ),
    (
        &["inventory turnover"],
        "reference:efficiency-ratios",
        "Inventory turnover = cost of goods sold / inventory. Higher values mean inventory is sold faster.",
    ),
    (
        &["debt to equity", "leverage ratio"],
        "reference:leverage-ratios",
        "Debt-to-equity ratio = total debt / shareholders' equity. The market variant divides by the market value of equity instead of book equity.",
    ),
    (
        &["market value of equity", "market capitalization", "market equity"],
        "reference:valuation",
        "Market value of equity = book equity x price-to-book ratio, or share price x shares outstanding.",
    ),
    (
        &["price to book", "p/b", "price/book"],
        "reference:market-multiples",
        "Median price-to-book ratio: 3.0 (long-run, large-cap US equities)",
    ),
    (
        &["enterprise value", "ev/sales", "ev to sales"],
        "reference:valuation",
        "Enterprise value = market value of equity + total debt - cash and cash equivalents. EV/Sales = enterprise value / revenue.",
    ),
    (
        &["adjusted ebitda"],
        "reference:non-gaap",
        "Adjusted EBITDA = EBITDA + restructuring charges + stock-based compensation. Adjustments vary by company and are not standardized.",
    ),
    (
        &["ebitda"],
        "reference:earnings-measures",
        "EBITDA = operating income + depreciation and amortization. EBITDA (earnings before interest, taxes, depreciation and amortization) measures operating profitability before financing costs and non-cash charges.",
    ),
    (
        &["working capital"],
        "reference:liquidity-ratios",
        "Working capital is current assets minus current liabilities; it measures the resources available to fund day-to-day operations.",
    ),
    (
        &["free cash flow"],
        "reference:cash-flow",
        "Free cash flow is operating cash flow minus capital expenditures; it is the cash a business generates after maintaining its asset base.",
    ),
    (
        &["weighted average cost of capital", "wacc"],
        "reference:valuation",
        "The weighted average cost of capital (WACC) is the blended required return of debt and equity holders, weighted by their share of the capital structure.",
    ),
];

/// Web search over a fixed reference table
pub struct StaticWebTool {
    entries: Vec<ReferenceEntry>,
}

impl StaticWebTool {
    pub fn new(entries: Vec<ReferenceEntry>) -> Self {
        Self { entries }
    }

    /// Formulas, definitions and market benchmarks for the metric catalogue
    pub fn with_reference_entries() -> Self {
        Self::new(
            REFERENCE_TABLE
                .iter()
                .map(|(keywords, source, text)| ReferenceEntry::new(keywords, source, text))
                .collect(),
        )
    }
}

#[async_trait::async_trait]
impl ToolBackend for StaticWebTool {
    fn kind(&self) -> ToolKind {
        ToolKind::WebSearch
    }

    fn description(&self) -> &'static str {
        "Reference lookup for formulas, definitions and market benchmarks"
    }

    async fn search(&self, query: &str, options: &ToolOptions) -> Result<ToolResult> {
        let ToolOptions::WebSearch(options) = options else {
            return Err(OrchestrationError::InvalidToolInput(
                "web search requires web search options".to_string(),
            ));
        };

        let normalized = query.to_lowercase().replace('-', " ");

        let mut matches: Vec<(usize, &ReferenceEntry)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .keywords
                    .iter()
                    .filter(|k| normalized.contains(k.as_str()))
                    .map(|k| k.len())
                    .max()
                    .map(|len| (len, entry))
            })
            .collect();

        // Longest keyword first so specific entries outrank generic ones
        matches.sort_by(|a, b| b.0.cmp(&a.0));

        let limit = options.result_depth.item_limit();
        let truncated = matches.len() > limit;
        let items = matches
            .into_iter()
            .take(limit)
            .map(|(len, entry)| ToolItem {
                source: entry.source.clone(),
                text: entry.text.clone(),
                score: Some((len as f32 / normalized.len().max(1) as f32).min(1.0)),
            })
            .collect();

        Ok(ToolResult { items, truncated })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Timeout,
    Unavailable,
    Empty,
}

/// Wraps a backend and fails queries containing a pattern
pub struct FailureInjectingTool {
    inner: Arc<dyn ToolBackend>,
    rules: Vec<(String, FailureMode)>,
}

impl FailureInjectingTool {
    pub fn new(inner: Arc<dyn ToolBackend>) -> Self {
        Self {
            inner,
            rules: Vec::new(),
        }
    }

    pub fn fail_on(mut self, pattern: &str, mode: FailureMode) -> Self {
        self.rules.push((pattern.to_lowercase(), mode));
        self
    }

    /// Fail every query
    pub fn fail_all(self, mode: FailureMode) -> Self {
        self.fail_on("", mode)
    }
}

#[async_trait::async_trait]
impl ToolBackend for FailureInjectingTool {
    fn kind(&self) -> ToolKind {
        self.inner.kind()
    }

    fn description(&self) -> &'static str {
        self.inner.description()
    }

    async fn search(&self, query: &str, options: &ToolOptions) -> Result<ToolResult> {
        let lowered = query.to_lowercase();
        let mode = self
            .rules
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern.as_str()))
            .map(|(_, mode)| *mode);

        match mode {
            Some(FailureMode::Timeout) => Err(OrchestrationError::ToolTimeout {
                tool: self.kind(),
                after_ms: None,
            }),
            Some(FailureMode::Unavailable) => Err(OrchestrationError::ToolUnavailable {
                tool: self.kind(),
                reason: "injected outage".to_string(),
            }),
            Some(FailureMode::Empty) => Ok(ToolResult::default()),
            None => self.inner.search(query, options).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextSearchOptions, ResultDepth, WebSearchOptions};
    use crate::tools::SAMPLE_CONTEXT;
    use std::collections::BTreeMap;

    fn context_options() -> ToolOptions {
        ToolOptions::ContextSearch(ContextSearchOptions::default())
    }

    #[tokio::test]
    async fn test_context_search_ranks_exact_line_first() {
        let tool = StaticContextTool::from_document("context", SAMPLE_CONTEXT);
        let result = tool.search("current assets", &context_options()).await.unwrap();

        assert_eq!(result.items[0].text, "Total current assets: 3,800");
        assert!(result
            .items
            .iter()
            .all(|item| !item.text.contains("Long-term debt")));
    }

    #[tokio::test]
    async fn test_context_search_respects_limits_and_filter() {
        let tool = StaticContextTool::from_document("context", SAMPLE_CONTEXT);
        let mut filter = BTreeMap::new();
        filter.insert("source".to_string(), "other".to_string());
        let options = ToolOptions::ContextSearch(ContextSearchOptions {
            filter: Some(filter),
            ..ContextSearchOptions::default()
        });

        let result = tool.search("total debt", &options).await.unwrap();
        assert!(result.is_empty());

        let narrow = ToolOptions::ContextSearch(ContextSearchOptions {
            max_results: 1,
            ..ContextSearchOptions::default()
        });
        let result = tool.search("current total", &narrow).await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_web_search_prefers_specific_entry() {
        let tool = StaticWebTool::with_reference_entries();
        let options = ToolOptions::WebSearch(WebSearchOptions::default());

        let result = tool.search("adjusted EBITDA formula", &options).await.unwrap();
        assert!(result.items[0].text.starts_with("Adjusted EBITDA"));
        assert_eq!(result.items.len(), 2);

        let shallow = ToolOptions::WebSearch(WebSearchOptions {
            result_depth: ResultDepth::Low,
            ..WebSearchOptions::default()
        });
        let result = tool.search("adjusted EBITDA formula", &shallow).await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let tool = FailureInjectingTool::new(Arc::new(StaticWebTool::with_reference_entries()))
            .fail_on("price to book", FailureMode::Timeout);
        let options = ToolOptions::WebSearch(WebSearchOptions::default());

        let err = tool.search("Price to book median", &options).await.unwrap_err();
        assert!(err.is_tool_failure());

        let ok = tool.search("current ratio formula", &options).await.unwrap();
        assert!(!ok.is_empty());
    }
}
