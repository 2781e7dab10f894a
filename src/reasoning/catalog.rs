//! Metric catalogue and figure extraction
//!
//! Each metric names its input variables, how they are sourced, and the
//! ordered derivations that produce it. The last derivation is the metric.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Sum,
    Difference,
    Product,
    Ratio,
}

impl Operation {
    /// Left fold over the operands; `None` on division by zero
    pub fn apply(self, operands: &[f64]) -> Option<f64> {
        let (first, rest) = operands.split_first()?;
        match self {
            Operation::Sum => Some(operands.iter().sum()),
            Operation::Difference => Some(rest.iter().fold(*first, |acc, v| acc - v)),
            Operation::Product => Some(operands.iter().product()),
            Operation::Ratio => rest.iter().try_fold(*first, |acc, v| {
                if *v == 0.0 {
                    None
                } else {
                    Some(acc / v)
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sourcing {
    /// Read from the question text or the source documents
    Retrieve,
    /// Public benchmark, with a fallback when the search yields nothing
    Estimate {
        query: &'static str,
        fallback: f64,
        justification: &'static str,
    },
}

/// Stand-in for a retrieved figure that could not be found: a multiple of
/// another input of the same metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proxy {
    pub basis: &'static str,
    pub factor: f64,
    pub justification: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Variable {
    pub key: &'static str,
    pub label: &'static str,
    pub aliases: &'static [&'static str],
    pub sourcing: Sourcing,
    pub proxy: Option<Proxy>,
}

impl Variable {
    pub fn labels(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.label).chain(self.aliases.iter().copied())
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self.sourcing, Sourcing::Estimate { .. })
    }

    const fn proxied(self, basis: &'static str, factor: f64, justification: &'static str) -> Self {
        Variable {
            proxy: Some(Proxy {
                basis,
                factor,
                justification,
            }),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Derivation {
    pub key: &'static str,
    pub label: &'static str,
    pub formula: &'static str,
    pub operation: Operation,
    pub operands: &'static [&'static str],
    /// Web query that confirms the formula
    pub reference_query: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub key: &'static str,
    pub name: &'static str,
    pub keywords: &'static [&'static str],
    pub variables: &'static [Variable],
    pub derivations: &'static [Derivation],
    /// Judgment the metric always carries (description, justification)
    pub adjustment: Option<(&'static str, &'static str)>,
}

impl Metric {
    pub fn result(&self) -> Option<&Derivation> {
        self.derivations.last()
    }

    pub fn variable(&self, key: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.key == key)
    }

    /// Needs an estimate or a judgment call, so the basic path cannot serve it
    pub fn requires_assumptions(&self) -> bool {
        self.adjustment.is_some() || self.variables.iter().any(Variable::is_estimate)
    }

    /// True when a derivation consumes an estimated variable
    pub fn derivation_uses_estimate(&self, derivation: &Derivation) -> bool {
        derivation
            .operands
            .iter()
            .any(|op| self.variable(op).is_some_and(Variable::is_estimate))
    }
}

const fn retrieve(
    key: &'static str,
    label: &'static str,
    aliases: &'static [&'static str],
) -> Variable {
    Variable {
        key,
        label,
        aliases,
        sourcing: Sourcing::Retrieve,
        proxy: None,
    }
}

const CURRENT_ASSETS: Variable = retrieve("current_assets", "current assets", &[]);
const CURRENT_LIABILITIES: Variable = retrieve("current_liabilities", "current liabilities", &[]);
const CASH: Variable = retrieve("cash", "cash and cash equivalents", &["cash"]);
const RECEIVABLES: Variable = retrieve("receivables", "accounts receivable", &["receivables"]);
const REVENUE: Variable = retrieve("revenue", "revenue", &["sales", "net sales"]);
const COGS: Variable = retrieve("cogs", "cost of goods sold", &["cogs", "cost of sales"]);
const INVENTORY: Variable = retrieve("inventory", "inventory", &["inventories"]);
const TOTAL_DEBT: Variable = retrieve("total_debt", "total debt", &["debt"]).proxied(
    "book_equity",
    0.5,
    "Median book debt-to-equity of large-cap US non-financial companies is about 0.5",
);
const BOOK_EQUITY: Variable = retrieve(
    "book_equity",
    "shareholders' equity",
    &["shareholders equity", "stockholders' equity", "book equity"],
);
const OPERATING_INCOME: Variable =
    retrieve("operating_income", "operating income", &["ebit", "operating profit"]);
const DEPRECIATION: Variable = retrieve(
    "depreciation_amortization",
    "depreciation and amortization",
    &["d&a", "depreciation"],
);
const RESTRUCTURING: Variable =
    retrieve("restructuring", "restructuring charges", &["restructuring"]).proxied(
        "operating_income",
        0.0,
        "No restructuring charge disclosed; the add-back is taken as zero",
    );
const STOCK_COMPENSATION: Variable = retrieve(
    "stock_compensation",
    "stock based compensation",
    &["share based compensation"],
)
.proxied(
    "operating_income",
    0.0,
    "No stock-based compensation disclosed; the add-back is taken as zero",
);

const PRICE_TO_BOOK: Variable = Variable {
    key: "price_to_book",
    label: "price to book ratio",
    aliases: &["p/b ratio", "price/book"],
    sourcing: Sourcing::Estimate {
        query: "median price-to-book ratio large-cap equities",
        fallback: 3.0,
        justification: "Long-run median price-to-book of large-cap US equities",
    },
    proxy: None,
};

const MARKET_EQUITY: Derivation = Derivation {
    key: "market_equity",
    label: "market value of equity",
    formula: "market_equity = book_equity * price_to_book",
    operation: Operation::Product,
    operands: &["book_equity", "price_to_book"],
    reference_query: "market value of equity formula",
};

const EBITDA: Derivation = Derivation {
    key: "ebitda",
    label: "EBITDA",
    formula: "ebitda = operating_income + depreciation_amortization",
    operation: Operation::Sum,
    operands: &["operating_income", "depreciation_amortization"],
    reference_query: "EBITDA formula",
};

const GROSS_PROFIT: Derivation = Derivation {
    key: "gross_profit",
    label: "gross profit",
    formula: "gross_profit = revenue - cogs",
    operation: Operation::Difference,
    operands: &["revenue", "cogs"],
    reference_query: "gross profit formula",
};

/// Most specific keywords first
pub static METRICS: &[Metric] = &[
    Metric {
        key: "market_debt_to_equity",
        name: "market debt-to-equity ratio",
        keywords: &["market debt to equity", "market d/e", "market leverage"],
        variables: &[TOTAL_DEBT, BOOK_EQUITY, PRICE_TO_BOOK],
        derivations: &[
            MARKET_EQUITY,
            Derivation {
                key: "market_debt_to_equity",
                label: "market debt-to-equity ratio",
                formula: "market_debt_to_equity = total_debt / market_equity",
                operation: Operation::Ratio,
                operands: &["total_debt", "market_equity"],
                reference_query: "market debt-to-equity ratio formula",
            },
        ],
        adjustment: None,
    },
    Metric {
        key: "debt_to_equity",
        name: "debt-to-equity ratio",
        keywords: &["debt to equity", "d/e ratio", "leverage ratio"],
        variables: &[TOTAL_DEBT, BOOK_EQUITY],
        derivations: &[Derivation {
            key: "debt_to_equity",
            label: "debt-to-equity ratio",
            formula: "debt_to_equity = total_debt / book_equity",
            operation: Operation::Ratio,
            operands: &["total_debt", "book_equity"],
            reference_query: "debt-to-equity ratio formula",
        }],
        adjustment: None,
    },
    Metric {
        key: "adjusted_ebitda",
        name: "adjusted EBITDA",
        keywords: &["adjusted ebitda"],
        variables: &[OPERATING_INCOME, DEPRECIATION, RESTRUCTURING, STOCK_COMPENSATION],
        derivations: &[
            EBITDA,
            Derivation {
                key: "adjusted_ebitda",
                label: "adjusted EBITDA",
                formula: "adjusted_ebitda = ebitda + restructuring + stock_compensation",
                operation: Operation::Sum,
                operands: &["ebitda", "restructuring", "stock_compensation"],
                reference_query: "adjusted EBITDA formula",
            },
        ],
        adjustment: Some((
            "Add-backs limited to restructuring charges and stock-based compensation",
            "Non-GAAP adjustments are company specific; only items disclosed in the filing are added back",
        )),
    },
    Metric {
        key: "ebitda",
        name: "EBITDA",
        keywords: &["ebitda"],
        variables: &[OPERATING_INCOME, DEPRECIATION],
        derivations: &[EBITDA],
        adjustment: None,
    },
    Metric {
        key: "ev_to_sales",
        name: "EV/Sales",
        keywords: &["ev/sales", "ev to sales", "enterprise value to sales", "ev/revenue"],
        variables: &[TOTAL_DEBT, CASH, BOOK_EQUITY, PRICE_TO_BOOK, REVENUE],
        derivations: &[
            MARKET_EQUITY,
            Derivation {
                key: "equity_plus_debt",
                label: "market equity plus debt",
                formula: "equity_plus_debt = market_equity + total_debt",
                operation: Operation::Sum,
                operands: &["market_equity", "total_debt"],
                reference_query: "enterprise value formula",
            },
            Derivation {
                key: "enterprise_value",
                label: "enterprise value",
                formula: "enterprise_value = equity_plus_debt - cash",
                operation: Operation::Difference,
                operands: &["equity_plus_debt", "cash"],
                reference_query: "enterprise value formula",
            },
            Derivation {
                key: "ev_to_sales",
                label: "EV/Sales",
                formula: "ev_to_sales = enterprise_value / revenue",
                operation: Operation::Ratio,
                operands: &["enterprise_value", "revenue"],
                reference_query: "EV/Sales formula",
            },
        ],
        adjustment: None,
    },
    Metric {
        key: "gross_margin",
        name: "gross margin",
        keywords: &["gross margin"],
        variables: &[REVENUE, COGS],
        derivations: &[
            GROSS_PROFIT,
            Derivation {
                key: "gross_margin",
                label: "gross margin",
                formula: "gross_margin = gross_profit / revenue",
                operation: Operation::Ratio,
                operands: &["gross_profit", "revenue"],
                reference_query: "gross margin formula",
            },
        ],
        adjustment: None,
    },
    Metric {
        key: "gross_profit",
        name: "gross profit",
        keywords: &["gross profit"],
        variables: &[REVENUE, COGS],
        derivations: &[GROSS_PROFIT],
        adjustment: None,
    },
    Metric {
        key: "quick_ratio",
        name: "quick ratio",
        keywords: &["quick ratio", "acid test"],
        variables: &[CASH, RECEIVABLES, CURRENT_LIABILITIES],
        derivations: &[
            Derivation {
                key: "quick_assets",
                label: "quick assets",
                formula: "quick_assets = cash + receivables",
                operation: Operation::Sum,
                operands: &["cash", "receivables"],
                reference_query: "quick ratio formula",
            },
            Derivation {
                key: "quick_ratio",
                label: "quick ratio",
                formula: "quick_ratio = quick_assets / current_liabilities",
                operation: Operation::Ratio,
                operands: &["quick_assets", "current_liabilities"],
                reference_query: "quick ratio formula",
            },
        ],
        adjustment: None,
    },
    Metric {
        key: "current_ratio",
        name: "current ratio",
        keywords: &["current ratio"],
        variables: &[CURRENT_ASSETS, CURRENT_LIABILITIES],
        derivations: &[Derivation {
            key: "current_ratio",
            label: "current ratio",
            formula: "current_ratio = current_assets / current_liabilities",
            operation: Operation::Ratio,
            operands: &["current_assets", "current_liabilities"],
            reference_query: "current ratio formula",
        }],
        adjustment: None,
    },
    Metric {
        key: "inventory_turnover",
        name: "inventory turnover",
        keywords: &["inventory turnover"],
        variables: &[COGS, INVENTORY],
        derivations: &[Derivation {
            key: "inventory_turnover",
            label: "inventory turnover",
            formula: "inventory_turnover = cogs / inventory",
            operation: Operation::Ratio,
            operands: &["cogs", "inventory"],
            reference_query: "inventory turnover formula",
        }],
        adjustment: None,
    },
];

/// Lowercase with hyphens as spaces
pub fn normalize(text: &str) -> String {
    text.to_lowercase().replace('-', " ")
}

/// First catalogue metric whose keyword appears in the text
pub fn find_metric(text: &str) -> Option<&'static Metric> {
    let text = normalize(text);
    METRICS
        .iter()
        .find(|m| m.keywords.iter().any(|k| text.contains(k)))
}

fn figure_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^\s*(?:\([^)]*\))?\s*(?:=|:|of|is|was|were|at)?\s*(?:usd|\$)?\s*(\d[\d,]*(?:\.\d+)?)",
            )
            .ok()
        })
        .as_ref()
}

/// Figure stated right after any of the variable's labels
pub fn extract_figure(text: &str, variable: &Variable) -> Option<f64> {
    variable
        .labels()
        .find_map(|label| extract_labelled(text, label))
}

/// Figure stated right after `label`, e.g. "label = 1,000" or "label: $1,000"
pub fn extract_labelled(text: &str, label: &str) -> Option<f64> {
    let pattern = figure_pattern()?;
    let text = normalize(text);
    let label = normalize(label);

    text.match_indices(label.as_str()).find_map(|(pos, _)| {
        let at_word_start = text[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_ascii_alphanumeric());
        if !at_word_start {
            return None;
        }
        pattern
            .captures(&text[pos + label.len()..])
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
    })
}

/// Core term of a definitional question ("What is EBITDA?" gives "ebitda")
pub fn concept_term(text: &str) -> String {
    const PREFIXES: &[&str] = &[
        "what is the", "what is an", "what is a", "what is", "what are the", "what are",
        "what does", "define the", "define", "explain the", "explain", "meaning of",
    ];

    let mut term = normalize(text)
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .to_string();

    for prefix in PREFIXES {
        if let Some(rest) = term.strip_prefix(prefix) {
            term = rest.trim().to_string();
            break;
        }
    }

    for suffix in [" mean", " stand for"] {
        if let Some(rest) = term.strip_suffix(suffix) {
            term = rest.trim().to_string();
        }
    }

    term
}
