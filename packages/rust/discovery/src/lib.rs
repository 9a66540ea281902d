//! Sitemap discovery for a company site.
//!
//! Before any article is written, articleforge reads the company's sitemap
//! to learn which pages exist: blog posts and resources become internal-link
//! candidates later. Discovery is plain HTTP, no AI:
//! 1. `robots.txt` `Sitemap:` lines, falling back to `/sitemap.xml`
//! 2. sitemap indexes are followed to a bounded depth
//! 3. same-host page URLs are categorised into a [`SitemapIndex`]

mod parser;

use std::collections::{HashSet, VecDeque};

use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use articleforge_shared::{ArticleForgeError, Result, SitemapIndex};

pub use parser::{SitemapDoc, categorize, parse_robots_sitemaps, parse_sitemap};

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 3;

/// Default timeout in seconds for each request.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Maximum sitemap body size we accept (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("articleforge/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for sitemap discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// Maximum sitemap documents fetched, indexes included.
    pub max_sitemaps: usize,
    /// Maximum nesting of sitemap indexes.
    pub max_depth: usize,
    /// Maximum page URLs kept.
    pub max_urls: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_sitemaps: 25,
            max_depth: 2,
            max_urls: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Discover and categorise the sitemap of the site at `url`.
///
/// Returns an error only when no sitemap could be read at all; individual
/// child sitemaps that fail are skipped.
#[instrument(skip_all, fields(url = %url))]
pub async fn discover_sitemap(url: &Url, opts: &DiscoveryOptions) -> Result<SitemapIndex> {
    let origin = origin_url(url)?;
    let host = url.host_str().unwrap_or_default().trim_start_matches("www.").to_string();
    let client = build_client(opts)?;

    let mut roots = match fetch_text(&client, &format!("{origin}/robots.txt")).await {
        Ok(robots) => parse_robots_sitemaps(&robots),
        Err(e) => {
            debug!(error = %e, "robots.txt unavailable");
            Vec::new()
        }
    };
    if roots.is_empty() {
        roots.push(format!("{origin}/sitemap.xml"));
    }
    info!(roots = roots.len(), "reading sitemaps");

    let mut queue: VecDeque<(String, usize)> = roots.into_iter().map(|r| (r, 0)).collect();
    let mut seen = HashSet::new();
    let mut index = SitemapIndex::default();
    let mut fetched = 0usize;
    let mut page_urls = 0usize;
    let mut last_error = None;

    while let Some((sitemap_url, depth)) = queue.pop_front() {
        if fetched >= opts.max_sitemaps || !seen.insert(sitemap_url.clone()) {
            continue;
        }
        fetched += 1;

        let body = match fetch_text(&client, &sitemap_url).await {
            Ok(body) => body,
            Err(e) => {
                warn!(%sitemap_url, error = %e, "sitemap fetch failed");
                last_error = Some(e);
                continue;
            }
        };

        match parse_sitemap(&body) {
            Some(SitemapDoc::Index(children)) if depth < opts.max_depth => {
                debug!(%sitemap_url, children = children.len(), "sitemap index");
                queue.extend(children.into_iter().map(|c| (c, depth + 1)));
            }
            Some(SitemapDoc::Index(_)) => {
                debug!(%sitemap_url, "sitemap index nested too deep, skipping");
            }
            Some(SitemapDoc::UrlSet(pages)) => {
                for page in pages {
                    if page_urls >= opts.max_urls {
                        break;
                    }
                    let Ok(page_url) = Url::parse(&page) else {
                        continue;
                    };
                    if !same_site(&page_url, &host) {
                        continue;
                    }
                    index.push(categorize(&page_url), page);
                    page_urls += 1;
                }
            }
            None => {
                last_error = Some(ArticleForgeError::parse(format!(
                    "{sitemap_url}: not a sitemap document"
                )));
            }
        }
    }

    if index.total() == 0 {
        if let Some(e) = last_error {
            return Err(e);
        }
    }

    info!(
        sitemaps = fetched,
        urls = index.total(),
        blog = index.blog.len(),
        resource = index.resource.len(),
        "sitemap discovered"
    );
    Ok(index)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the origin (scheme + host + port) from a URL.
fn origin_url(url: &Url) -> Result<String> {
    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| ArticleForgeError::validation(format!("URL has no host: {url}")))?;

    match url.port() {
        Some(port) => Ok(format!("{scheme}://{host}:{port}")),
        None => Ok(format!("{scheme}://{host}")),
    }
}

/// Same host, ignoring a leading `www.`.
fn same_site(url: &Url, host: &str) -> bool {
    url.host_str()
        .is_some_and(|h| h.trim_start_matches("www.").eq_ignore_ascii_case(host))
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(std::time::Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| ArticleForgeError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch a URL as text, rejecting non-2xx and oversized responses.
async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ArticleForgeError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ArticleForgeError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(ArticleForgeError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| ArticleForgeError::Network(format!("{url}: failed to read body: {e}")))
}
