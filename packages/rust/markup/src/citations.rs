//! Numbered citation markers (`[1]`, `[2]`, ...) in body HTML.
//!
//! Markers are 1-based indexes into the document's sources list. Markers
//! already wrapped in an anchor are left alone by every function here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use articleforge_shared::Source;

use crate::escape_attr;
use crate::replace::protected_spans;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").expect("valid regex"));

/// Whether a whitespace-separated token is a bare marker, e.g. `[4]` or `[4].`.
pub(crate) fn is_marker_token(token: &str) -> bool {
    let token = token.trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
    token.len() > 2
        && token.starts_with('[')
        && token.ends_with(']')
        && token[1..token.len() - 1].chars().all(|c| c.is_ascii_digit())
}

/// Apply `f` to every unlinked marker; `f` returns the replacement text.
fn rewrite_markers(html: &str, mut f: impl FnMut(usize, &Captures) -> String) -> String {
    let spans = protected_spans(html);
    MARKER_RE
        .replace_all(html, |caps: &Captures| {
            let whole = caps.get(0).map(|m| m.start()).unwrap_or(0);
            if spans.iter().any(|(s, e)| whole >= *s && whole < *e) {
                return caps[0].to_string();
            }
            match caps[1].parse::<usize>() {
                Ok(n) => f(n, caps),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Distinct marker numbers used in `html` outside anchors.
pub fn marker_numbers(html: &str) -> BTreeSet<usize> {
    let mut found = BTreeSet::new();
    rewrite_markers(html, |n, caps| {
        found.insert(n);
        caps[0].to_string()
    });
    found
}

/// Remove every marker numbered `n`, with the space before it.
/// Returns the new HTML and the number of markers removed.
pub fn remove_marker(html: &str, n: usize) -> (String, usize) {
    static SPACED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t]?\[(\d{1,3})\]").expect("valid regex"));

    let spans = protected_spans(html);
    let mut removed = 0;
    let out = SPACED_RE
        .replace_all(html, |caps: &Captures| {
            let bracket = caps.get(1).map(|m| m.start() - 1).unwrap_or(0);
            let inside = spans.iter().any(|(s, e)| bracket >= *s && bracket < *e);
            if !inside && caps[1].parse::<usize>().ok() == Some(n) {
                removed += 1;
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned();
    (out, removed)
}

/// Renumber markers through `mapping` (old → new) in a single pass.
/// Markers without a mapping entry are kept as they are.
pub fn renumber(html: &str, mapping: &BTreeMap<usize, usize>) -> String {
    rewrite_markers(html, |n, caps| match mapping.get(&n) {
        Some(new) => format!("[{new}]"),
        None => caps[0].to_string(),
    })
}

/// A marker with no matching source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DanglingMarker(pub usize);

/// Resolve markers into citation anchors pointing at `sources`.
/// Returns the linked HTML and the number of markers linked.
pub fn link_markers(html: &str, sources: &[Source]) -> Result<(String, usize), DanglingMarker> {
    let mut dangling = None;
    let mut linked = 0;
    let out = rewrite_markers(html, |n, caps| match n.checked_sub(1).and_then(|i| sources.get(i)) {
        Some(source) => {
            linked += 1;
            format!(
                r#"<a href="{}" class="citation" target="_blank" rel="noopener">[{n}]</a>"#,
                escape_attr(&source.url)
            )
        }
        None => {
            if dangling.is_none() {
                dangling = Some(n);
            }
            caps[0].to_string()
        }
    });
    match dangling {
        Some(n) => Err(DanglingMarker(n)),
        None => Ok((out, linked)),
    }
}
