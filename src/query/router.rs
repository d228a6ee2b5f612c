//! Deterministic query routing.
//!
//! A small keyword heuristic, no LLM involved: global/sensemaking questions
//! go to GraphRAG, factual/relational ones to PathRAG, everything else to
//! the vector fallback. An explicit mode always wins over the heuristic.

use crate::domain::answer::QueryMode;

/// Comparison / synthesis markers (global questions).
const COMPARE_WORDS: &[&str] = &[
    "compare",
    "différence",
    "avantages",
    "inconvénients",
    "impact",
    "panorama",
    "synthèse",
    "overview",
];

/// Relation markers (graph-shaped questions).
const GRAPHY_WORDS: &[&str] = &["relation", "lié", "entre", "cause", "conséquence"];

/// Factual question openers.
const FACT_PREFIXES: &[&str] = &["qui", "quoi", "quand", "où", "combien", "lequel", "laquelle"];

/// Word count above which an open question is treated as global.
const LONG_QUESTION_WORDS: usize = 14;

/// Routing decision with the rule that fired, for the debug payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub mode: QueryMode,
    pub rule: &'static str,
}

/// Route a question. `requested` overrides the heuristic unless it is `Auto`.
#[must_use]
pub fn route(question: &str, requested: QueryMode) -> Route {
    if requested != QueryMode::Auto {
        return Route {
            mode: requested,
            rule: "explicit",
        };
    }

    let q = question.trim().to_lowercase();
    let long = q.split_whitespace().count() >= LONG_QUESTION_WORDS;
    let compare = COMPARE_WORDS.iter().any(|w| q.contains(w));
    let graphy = GRAPHY_WORDS.iter().any(|w| q.contains(w));
    let fact = FACT_PREFIXES.iter().any(|w| q.starts_with(w));
    let nums = q.chars().any(|c| c.is_ascii_digit());

    if compare || (long && !fact) {
        Route {
            mode: QueryMode::Graph,
            rule: "global/sensemaking",
        }
    } else if graphy || (fact && (nums || q.contains("entre"))) {
        Route {
            mode: QueryMode::Path,
            rule: "local/fact+relations",
        }
    } else {
        Route {
            mode: QueryMode::Vector,
            rule: "fallback/simple",
        }
    }
}
