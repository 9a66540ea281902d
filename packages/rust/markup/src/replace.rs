//! Anchor-aware, single-occurrence text replacement.
//!
//! Link embeddings and refresh updates name an exact substring of a body
//! field. A match counts only when it lies in plain text: never inside a tag
//! and never inside an existing `<a>...</a>` element. Re-applying an
//! embedding therefore finds nothing and changes nothing.

use std::sync::LazyLock;

use regex::Regex;

/// Byte ranges of `html` that text replacement must not touch: whole anchor
/// elements and every tag.
pub(crate) fn protected_spans(html: &str) -> Vec<(usize, usize)> {
    static ANCHOR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)<a\b[^>]*>.*?</a\s*>").expect("valid regex"));
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

    let mut spans: Vec<(usize, usize)> = ANCHOR_RE
        .find_iter(html)
        .chain(TAG_RE.find_iter(html))
        .map(|m| (m.start(), m.end()))
        .collect();
    spans.sort_unstable();
    spans
}

/// Byte offset of the first occurrence of `needle` lying entirely in plain text.
pub fn find_outside_anchors(html: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let spans = protected_spans(html);
    html.match_indices(needle).map(|(i, _)| i).find(|&start| {
        let end = start + needle.len();
        !spans.iter().any(|&(s, e)| start < e && end > s)
    })
}

/// Replace the first plain-text occurrence of `find` with `replacement`.
/// `None` when there is no such occurrence.
pub fn replace_once_outside_anchors(html: &str, find: &str, replacement: &str) -> Option<String> {
    let start = find_outside_anchors(html, find)?;
    let mut out = String::with_capacity(html.len() + replacement.len());
    out.push_str(&html[..start]);
    out.push_str(replacement);
    out.push_str(&html[start + find.len()..]);
    Some(out)
}

/// All `href` attribute values in `html`.
pub fn hrefs(html: &str) -> Vec<String> {
    static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?i)href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
    });

    HREF_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Whether `html` links to `url`.
pub fn contains_href(html: &str, url: &str) -> bool {
    hrefs(html).iter().any(|h| h == url)
}

/// Whether replacing `find` with `replacement` introduces anchor markup:
/// more `<a>` elements, or an `href` that `find` did not carry.
pub fn adds_anchor(find: &str, replacement: &str) -> bool {
    static ANCHOR_OPEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)<a\b").expect("valid regex"));

    let before = hrefs(find);
    ANCHOR_OPEN_RE.find_iter(replacement).count() > ANCHOR_OPEN_RE.find_iter(find).count()
        || hrefs(replacement).iter().any(|h| !before.contains(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_plain_text_only() {
        let html = r#"<p>See <a href="/x">project tools</a> and project tools.</p>"#;
        let at = find_outside_anchors(html, "project tools").unwrap();
        assert_eq!(&html[at..at + 13], "project tools");
        assert!(at > html.find("</a>").unwrap());
    }

    #[test]
    fn ignores_matches_inside_tags() {
        let html = r#"<p class="intro">intro text</p>"#;
        let at = find_outside_anchors(html, "intro").unwrap();
        assert_eq!(at, html.find(">intro").unwrap() + 1);
    }

    #[test]
    fn replace_once_only_touches_first_match() {
        let html = "<p>alpha beta alpha</p>";
        let out = replace_once_outside_anchors(html, "alpha", "<a href=\"/a\">alpha</a>").unwrap();
        assert_eq!(out, "<p><a href=\"/a\">alpha</a> beta alpha</p>");
    }

    #[test]
    fn reapplying_embedding_is_noop() {
        let html = "<p>read the sprint guide today</p>";
        let replacement = r#"<a href="/blog/sprint">sprint guide</a>"#;
        let once = replace_once_outside_anchors(html, "sprint guide", replacement).unwrap();
        assert!(replace_once_outside_anchors(&once, "sprint guide", replacement).is_none());
    }

    #[test]
    fn missing_text_yields_none() {
        assert!(replace_once_outside_anchors("<p>abc</p>", "xyz", "q").is_none());
        assert!(find_outside_anchors("<p>abc</p>", "").is_none());
    }

    #[test]
    fn hrefs_are_collected() {
        let html = r#"<a href="/one">1</a><a class="c" href='/two'>2</a>"#;
        assert_eq!(hrefs(html), vec!["/one", "/two"]);
        assert!(contains_href(html, "/two"));
        assert!(!contains_href(html, "/three"));
    }

    #[test]
    fn anchor_additions_are_detected() {
        assert!(adds_anchor("great tools", r#"<a href="https://spam.test">great tools</a>"#));
        assert!(adds_anchor("great tools", "<A>great tools</A>"));
        assert!(adds_anchor("see it", "see <span href='/x'>it</span>"));
        assert!(!adds_anchor("great tools", "<strong>useful</strong> tools"));
        assert!(!adds_anchor(r#"<a href="/a">a</a> b"#, r#"<a href="/a">a</a> c"#));
    }
}
