//! Pulling a single statement out of free-form model output.
//!
//! This is a heuristic: the first `SELECT` up to the first `;`, closing
//! code fence, or the end of the text. Output without a `SELECT` is passed
//! through trimmed, which is how the not-relevant sentinel reaches the
//! caller.

use once_cell::sync::Lazy;
use regex::Regex;

/// Literal the fixed-schema prompt asks for when a question cannot be
/// answered from the dataset.
pub const NOT_RELEVANT: &str = "NOT RELEVANT QUESTION";

static SELECT_SPAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bSELECT\b.*?(?:;|```|\z)").expect("SELECT_SPAN is a valid regex")
});

pub fn extract_sql(generated_text: &str) -> String {
    match SELECT_SPAN.find(generated_text) {
        Some(span) => span
            .as_str()
            .trim()
            // a statement without `;` ends at its closing fence
            .trim_end_matches('`')
            .trim_end()
            .to_string(),
        None => generated_text.trim().to_string(),
    }
}

pub fn is_not_relevant(text: &str) -> bool {
    !SELECT_SPAN.is_match(text) && text.to_ascii_uppercase().contains(NOT_RELEVANT)
}
