//! Question classifier heuristics
//!
//! Keyword signals used by the router: whether a question asks for a
//! numeric computation, whether it asks for a definition, and whether the
//! answer needs judgment. Also owns the tactical-precedence tie-break.

use crate::models::{Category, Question};

/// Static keyword lists
const COMPUTE_KEYWORDS: &[&str] = &[
    // Imperatives
    "calculate", "compute", "estimate", "determine", "derive", "work out",
    // Quantities
    "how much", "how many", "what was", "what were",
    // Periods
    "in the year", "for the year", "fiscal", "quarter",
];

const DEFINITION_KEYWORDS: &[&str] = &[
    "what is", "what are", "what does", "define", "definition", "meaning",
    "explain", "difference between", "why do", "why does", "concept",
];

const JUDGMENT_KEYWORDS: &[&str] = &[
    "estimate", "adjusted", "assume", "assuming", "approximately", "market value",
    "market debt", "implied", "forecast", "projected", "fully diluted", "normalized",
];

pub struct QuestionClassifier;

impl QuestionClassifier {
    /// True when the question asks for a number to be produced
    pub fn requests_numeric_computation(text: &str) -> bool {
        let text = text.to_lowercase();

        COMPUTE_KEYWORDS.iter().any(|kw| text.contains(kw)) || contains_figures(&text)
    }

    pub fn is_definitional(text: &str) -> bool {
        let text = text.to_lowercase();
        DEFINITION_KEYWORDS.iter().any(|kw| text.contains(kw))
    }

    pub fn requires_judgment(text: &str) -> bool {
        let text = text.to_lowercase();
        JUDGMENT_KEYWORDS.iter().any(|kw| text.contains(kw))
    }

    /// Tool-free category guess
    pub fn hint(question: &Question) -> Category {
        let numeric = Self::requests_numeric_computation(&question.text);

        if numeric && Self::requires_judgment(&question.text) {
            Category::TacticalAssumptionBased
        } else if numeric {
            Category::TacticalBasic
        } else {
            Category::Conceptual
        }
    }

    /// Tactical precedence: a question that asks for a number is never
    /// conceptual. It goes to the basic specialist only when every router
    /// context search succeeded with hits.
    pub fn apply_tie_break(
        proposed: Category,
        question: &Question,
        context_confirmed: bool,
    ) -> Category {
        if proposed != Category::Conceptual || !Self::requests_numeric_computation(&question.text) {
            return proposed;
        }

        if context_confirmed {
            Category::TacticalBasic
        } else {
            Category::TacticalAssumptionBased
        }
    }
}

/// Any figure other than a bare year
fn contains_figures(text: &str) -> bool {
    text.split(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .map(|t| t.trim_matches(|c| c == ',' || c == '.'))
        .filter(|t| !t.is_empty())
        .any(|t| !is_year(t))
}

fn is_year(token: &str) -> bool {
    token.len() == 4
        && (token.starts_with("19") || token.starts_with("20"))
        && token.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_requests() {
        let cases = vec![
            "Calculate the current ratio given current assets = 1000 and current liabilities = 400",
            "What is Gross Profit in the year ending 2024?",
            "Estimate market debt-to-equity ratio",
            "Company X has revenue of 500 and COGS of 300. Gross margin?",
        ];

        for c in cases {
            assert!(
                QuestionClassifier::requests_numeric_computation(c),
                "expected numeric: {}",
                c
            );
        }
    }

    #[test]
    fn test_conceptual_questions() {
        let cases = vec![
            "What is EBITDA?",
            "Explain the difference between book and market leverage",
            "Why do analysts adjust EBITDA?",
        ];

        for c in cases {
            let question = Question::new(c);
            assert!(!QuestionClassifier::requests_numeric_computation(c));
            assert_eq!(QuestionClassifier::hint(&question), Category::Conceptual);
        }
    }

    #[test]
    fn test_judgment_hint() {
        let question = Question::new("Estimate market debt-to-equity ratio");
        assert_eq!(
            QuestionClassifier::hint(&question),
            Category::TacticalAssumptionBased
        );

        let question = Question::new("Compute the quick ratio for fiscal 2024");
        assert_eq!(QuestionClassifier::hint(&question), Category::TacticalBasic);
    }

    #[test]
    fn test_tie_break_prefers_tactical() {
        let question = Question::new("What is EBITDA for the year 2024?");

        assert_eq!(
            QuestionClassifier::apply_tie_break(Category::Conceptual, &question, true),
            Category::TacticalBasic
        );
        assert_eq!(
            QuestionClassifier::apply_tie_break(Category::Conceptual, &question, false),
            Category::TacticalAssumptionBased
        );

        let definitional = Question::new("What is EBITDA?");
        assert_eq!(
            QuestionClassifier::apply_tie_break(Category::Conceptual, &definitional, true),
            Category::Conceptual
        );
    }
}
