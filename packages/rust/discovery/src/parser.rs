//! robots.txt and sitemap XML parsing, and URL categorisation.
//!
//! - robots.txt: `Sitemap: <url>` lines, case-insensitive
//! - sitemap XML: `<urlset>` of pages or `<sitemapindex>` of child sitemaps,
//!   both read from their `<loc>` elements
//! - categories come from the first meaningful path segment, skipping a
//!   leading locale segment such as `/en/` or `/de-de/`

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use articleforge_shared::UrlCategory;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDoc {
    /// A `<urlset>` listing page URLs.
    UrlSet(Vec<String>),
    /// A `<sitemapindex>` listing child sitemap URLs.
    Index(Vec<String>),
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static SITEMAP_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*sitemap\s*:\s*(\S+)\s*$").expect("sitemap line regex"));

static LOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<loc>\s*(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?\s*</loc>").expect("loc regex"));

static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<sitemapindex[\s>]").expect("sitemapindex regex"));

static LOCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(?:[-_][a-z]{2})?$").expect("locale regex"));

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Sitemap URLs declared in a robots.txt body.
pub fn parse_robots_sitemaps(robots: &str) -> Vec<String> {
    SITEMAP_LINE_RE
        .captures_iter(robots)
        .map(|c| c[1].to_string())
        .collect()
}

/// Parse a sitemap XML body. `None` when the body is not a sitemap at all.
pub fn parse_sitemap(xml: &str) -> Option<SitemapDoc> {
    let locs: Vec<String> = LOC_RE
        .captures_iter(xml)
        .map(|c| unescape_xml(c[1].trim()))
        .filter(|loc| !loc.is_empty())
        .collect();

    if INDEX_RE.is_match(xml) {
        return Some(SitemapDoc::Index(locs));
    }
    if xml.contains("<urlset") || !locs.is_empty() {
        return Some(SitemapDoc::UrlSet(locs));
    }
    None
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ---------------------------------------------------------------------------
// Categorisation
// ---------------------------------------------------------------------------

/// Categorise a page URL by its path.
pub fn categorize(url: &Url) -> UrlCategory {
    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).map(|seg| seg.to_ascii_lowercase()).collect())
        .unwrap_or_default();

    let mut iter = segments.iter().map(String::as_str);
    let Some(first) = iter.next() else {
        return UrlCategory::Landing;
    };
    if let Some(category) = category_for(first) {
        return category;
    }
    if LOCALE_RE.is_match(first) {
        return match iter.next() {
            Some(next) => category_for(next).unwrap_or(UrlCategory::Other),
            None => UrlCategory::Landing,
        };
    }
    UrlCategory::Other
}

fn category_for(segment: &str) -> Option<UrlCategory> {
    let category = match segment {
        "blog" | "blogs" | "articles" | "article" | "news" | "insights" | "posts" | "post"
        | "stories" | "magazine" => UrlCategory::Blog,
        "product" | "products" | "features" | "feature" | "pricing" | "platform"
        | "integrations" | "apps" => UrlCategory::Product,
        "service" | "services" | "solutions" | "solution" | "consulting" | "industries"
        | "use-cases" => UrlCategory::Service,
        "docs" | "documentation" | "help" | "support" | "kb" | "knowledge-base" | "api"
        | "developers" | "reference" | "changelog" => UrlCategory::Docs,
        "resources" | "resource" | "guides" | "guide" | "whitepapers" | "ebooks" | "ebook"
        | "webinars" | "case-studies" | "customers" | "templates" | "glossary" | "learn"
        | "academy" | "reports" => UrlCategory::Resource,
        "about" | "about-us" | "company" | "team" | "careers" | "jobs" | "press"
        | "partners" | "investors" => UrlCategory::Company,
        "legal" | "privacy" | "privacy-policy" | "terms" | "terms-of-service" | "tos"
        | "imprint" | "impressum" | "cookies" | "cookie-policy" | "gdpr" | "dpa"
        | "security" => UrlCategory::Legal,
        "contact" | "contact-us" | "demo" | "book-a-demo" | "get-in-touch" | "sales"
        | "request-demo" => UrlCategory::Contact,
        "lp" | "landing" | "go" | "campaign" | "offers" => UrlCategory::Landing,
        _ => return None,
    };
    Some(category)
}
