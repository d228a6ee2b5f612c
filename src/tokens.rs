//! Approximate token counting and context fitting.
//!
//! The budgeter is the single source of truth for "fits the model context".
//! Counts are word-based approximations with a per-provider-family ratio;
//! exact tokenizer parity is not a goal, stable budgeting is.

use serde::Deserialize;

/// Provider family, used to pick the words-to-tokens ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// GPT-class models (~1.33 tokens per word).
    GptLike,
    /// Gemini-class models (~2 tokens per word).
    GeminiLike,
    /// Anything else (~1.5 tokens per word).
    #[default]
    Other,
}

impl ModelFamily {
    fn ratio(self) -> f64 {
        match self {
            Self::GptLike => 1.33,
            Self::GeminiLike => 2.0,
            Self::Other => 1.5,
        }
    }
}

/// Word-count based token budgeter.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudgeter {
    family: ModelFamily,
}

impl TokenBudgeter {
    #[must_use]
    pub fn new(family: ModelFamily) -> Self {
        Self { family }
    }

    /// Approximate token count: `words(text) * ratio + 1`.
    #[must_use]
    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let words = text.split_whitespace().count();
        (words as f64 * self.family.ratio()) as usize + 1
    }

    /// Truncate `text` so that it fits `max_tokens`.
    ///
    /// Sentences are accumulated until the next one would exceed the budget.
    /// If even the first sentence is over budget, the text is cut at
    /// `max_tokens * 4 * 0.9` characters (on a char boundary).
    #[must_use]
    pub fn fit(&self, text: &str, max_tokens: usize) -> String {
        if text.is_empty() || max_tokens == 0 {
            return String::new();
        }
        if self.count_tokens(text) <= max_tokens {
            return text.to_string();
        }

        let mut fitted = String::new();
        for sentence in split_sentences(text) {
            let candidate = if fitted.is_empty() {
                sentence.to_string()
            } else {
                format!("{fitted} {sentence}")
            };
            if self.count_tokens(&candidate) > max_tokens {
                break;
            }
            fitted = candidate;
        }

        if fitted.is_empty() {
            // One oversized sentence: hard character cut.
            let safe = (max_tokens as f64 * 4.0 * 0.9) as usize;
            fitted = text.chars().take(safe).collect();
        }
        fitted
    }
}

/// Split on sentence terminators followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            if end > i + 1 || end == bytes.len() {
                out.push(text[start..=i].trim());
                start = end;
                i = end;
                continue;
            }
        }
        i += 1;
    }
    if start < text.len() {
        let tail = text[start..].trim();
        if !tail.is_empty() {
            out.push(tail);
        }
    }
    out
}
