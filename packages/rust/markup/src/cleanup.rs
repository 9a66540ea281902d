//! Deterministic formatting passes for generated body HTML.
//!
//! Each pass is a function `&str -> (String, usize)` returning the rewritten
//! fragment and the number of fixes it made. Passes only move or drop markup
//! and whitespace; the words of the text are never changed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::trace;

/// Result of running every pass over one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub html: String,
    pub fixes: usize,
}

/// Run the full pass pipeline on one HTML fragment.
pub fn run_passes(html: &str) -> CleanupOutcome {
    const PASSES: [fn(&str) -> (String, usize); 6] = [
        markdown_emphasis_to_html,
        wrap_stranded_citations,
        wrap_stray_list_text,
        dedupe_citation_runs,
        remove_empty_paragraphs,
        collapse_whitespace,
    ];

    let mut current = html.to_string();
    let mut fixes = 0;
    for pass in PASSES {
        let (next, n) = pass(&current);
        if n > 0 {
            trace!(fixes = n, "cleanup pass applied");
        }
        current = next;
        fixes += n;
    }
    CleanupOutcome {
        html: current,
        fixes,
    }
}

// ---------------------------------------------------------------------------
// Pass 1: Markdown emphasis leaking into HTML
// ---------------------------------------------------------------------------

/// `**bold**` → `<strong>bold</strong>`.
fn markdown_emphasis_to_html(html: &str) -> (String, usize) {
    static BOLD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\*\*([^*\n]+?)\*\*").expect("valid regex"));

    let count = BOLD_RE.find_iter(html).count();
    if count == 0 {
        return (html.to_string(), 0);
    }
    (BOLD_RE.replace_all(html, "<strong>$1</strong>").into_owned(), count)
}

// ---------------------------------------------------------------------------
// Pass 2: Citations stranded after a closing paragraph tag
// ---------------------------------------------------------------------------

/// `<p>Claim.</p> [2]` → `<p>Claim. [2]</p>`.
fn wrap_stranded_citations(html: &str) -> (String, usize) {
    static STRANDED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</p>\s*((?:\[\d{1,3}\]\s*)+)").expect("valid regex")
    });

    let mut count = 0;
    let out = STRANDED_RE
        .replace_all(html, |caps: &Captures| {
            count += 1;
            format!(" {}</p>", caps[1].trim())
        })
        .into_owned();
    (out, count)
}

// ---------------------------------------------------------------------------
// Pass 3: Text directly inside a list, outside any <li>
// ---------------------------------------------------------------------------

/// `<ul>Intro<li>..` → `<ul><li>Intro</li><li>..`.
fn wrap_stray_list_text(html: &str) -> (String, usize) {
    static STRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(<(?:ul|ol)\b[^>]*>|</li>)\s*([^<\s][^<]*?)\s*(<li\b|</ul>|</ol>)")
            .expect("valid regex")
    });

    let mut count = 0;
    let out = STRAY_RE
        .replace_all(html, |caps: &Captures| {
            count += 1;
            format!("{}<li>{}</li>{}", &caps[1], &caps[2], &caps[3])
        })
        .into_owned();
    (out, count)
}

// ---------------------------------------------------------------------------
// Pass 4: Repeated citation markers
// ---------------------------------------------------------------------------

/// `[1][1] [2]` → `[1][2]`.
fn dedupe_citation_runs(html: &str) -> (String, usize) {
    static RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\[\d{1,3}\](?:\s*\[\d{1,3}\])+").expect("valid regex")
    });
    static ONE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").expect("valid regex"));

    let mut count = 0;
    let out = RUN_RE
        .replace_all(html, |caps: &Captures| {
            let run = &caps[0];
            let numbers: Vec<&str> = ONE_RE.captures_iter(run).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect();
            let mut seen = BTreeSet::new();
            let unique: Vec<&str> = numbers.iter().copied().filter(|n| seen.insert(*n)).collect();
            if unique.len() == numbers.len() {
                return run.to_string();
            }
            count += numbers.len() - unique.len();
            unique.iter().map(|n| format!("[{n}]")).collect::<String>()
        })
        .into_owned();
    (out, count)
}

// ---------------------------------------------------------------------------
// Pass 5: Empty paragraphs
// ---------------------------------------------------------------------------

fn remove_empty_paragraphs(html: &str) -> (String, usize) {
    static EMPTY_P_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)<p\b[^>]*>(?:\s|&nbsp;|<br\s*/?>)*</p>").expect("valid regex")
    });

    let count = EMPTY_P_RE.find_iter(html).count();
    if count == 0 {
        return (html.to_string(), 0);
    }
    (EMPTY_P_RE.replace_all(html, "").into_owned(), count)
}

// ---------------------------------------------------------------------------
// Pass 6: Whitespace
// ---------------------------------------------------------------------------

/// Collapse runs of spaces/tabs and drop whitespace hugging paragraph tags.
fn collapse_whitespace(html: &str) -> (String, usize) {
    static RUN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));
    static HUG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(<p>)[ \t]+|[ \t]+(</p>)").expect("valid regex"));

    let count = RUN_RE.find_iter(html).count() + HUG_RE.find_iter(html).count();
    if count == 0 {
        return (html.to_string(), 0);
    }
    let collapsed = RUN_RE.replace_all(html, " ");
    (HUG_RE.replace_all(&collapsed, "$1$2").into_owned(), count)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
