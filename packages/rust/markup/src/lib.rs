//! HTML-fragment utilities for article bodies.
//!
//! Body fields are small HTML fragments (`<p>`, `<ul>`, `<strong>`, ...)
//! carrying numbered citation markers such as `[3]`. This crate provides:
//! - text extraction and metrics ([`plain_text`], [`count_words`], [`count_statistics`])
//! - deterministic formatting passes ([`cleanup::run_passes`])
//! - citation-marker scanning, removal, renumbering and linking ([`citations`])
//! - anchor-aware single-occurrence replacement ([`replace`])

pub mod citations;
pub mod cleanup;
pub mod replace;

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;

pub use cleanup::{CleanupOutcome, run_passes};
pub use replace::{
    adds_anchor, contains_href, find_outside_anchors, hrefs, replace_once_outside_anchors,
};

// ---------------------------------------------------------------------------
// Text extraction
// ---------------------------------------------------------------------------

/// Visible text of an HTML fragment, whitespace-normalized.
pub fn plain_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    for text in fragment.root_element().text() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word count of an HTML fragment, ignoring citation markers.
pub fn count_words(html: &str) -> usize {
    plain_text(html)
        .split_whitespace()
        .filter(|w| !citations::is_marker_token(w))
        .count()
}

/// Escape text for use inside a double-quoted HTML attribute.
pub fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Quality signals
// ---------------------------------------------------------------------------

/// Case-insensitive whole-phrase occurrences of `phrase` in `text`.
pub fn count_phrase(text: &str, phrase: &str) -> usize {
    let phrase = phrase.trim();
    if phrase.is_empty() {
        return 0;
    }
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(phrase))) {
        Ok(re) => re.find_iter(text).count(),
        Err(_) => 0,
    }
}

/// Number-like tokens (`42`, `3.5`, `1,200`, `18%`) in order of appearance.
pub fn numbers_in(text: &str) -> Vec<String> {
    static NUM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)*%?").expect("valid regex"));

    NUM_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Statistics and data points: percentages, currency amounts, scaled numbers.
pub fn count_statistics(text: &str) -> usize {
    static STAT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)(?:[$€£]\s?\d[\d.,]*(?:\s?(?:k|m|bn|million|billion))?|\d[\d.,]*\s?(?:%|percent\b|x\b|million\b|billion\b|thousand\b))",
        )
        .expect("valid regex")
    });

    STAT_RE.find_iter(text).count()
}

/// Case studies and concrete examples signalled in prose.
pub fn count_case_studies(text: &str) -> usize {
    static CASE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:case stud(?:y|ies)|for example|for instance|in practice|real-world example)\b")
            .expect("valid regex")
    });

    CASE_RE.find_iter(text).count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_strips_tags() {
        let html = "<p>Hello <strong>world</strong>.</p><ul><li>One</li><li>Two</li></ul>";
        assert_eq!(plain_text(html), "Hello world . One Two");
    }

    #[test]
    fn count_words_skips_markers() {
        let html = "<p>Rust is fast [1] and safe [2].</p>";
        assert_eq!(count_words(html), 5);
    }

    #[test]
    fn count_phrase_matches_whole_words() {
        let text = "Project management tools help. project Management is hard. Mismanagement is not counted.";
        assert_eq!(count_phrase(text, "project management"), 2);
        assert_eq!(count_phrase(text, "management"), 2);
        assert_eq!(count_phrase(text, "  "), 0);
    }

    #[test]
    fn numbers_are_extracted_in_order() {
        assert_eq!(
            numbers_in("Revenue grew 18% to $1,200 in 2024, up 3.5x."),
            vec!["18%", "1,200", "2024", "3.5"]
        );
    }

    #[test]
    fn statistics_are_counted() {
        let text = "Adoption rose 42% in 2023. Teams saved $12,000 and shipped 3x faster; 5 million users.";
        assert_eq!(count_statistics(text), 4);
    }

    #[test]
    fn case_studies_are_counted() {
        let text = "For example, Acme cut costs. Our case study with Globex shows the same. Nothing else.";
        assert_eq!(count_case_studies(text), 2);
    }

    #[test]
    fn escape_attr_handles_quotes() {
        assert_eq!(escape_attr(r#"a"b&c"#), "a&quot;b&amp;c");
    }
}
