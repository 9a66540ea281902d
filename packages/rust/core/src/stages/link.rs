//! Stage 5: internal linking.
//!
//! Builds a ranked pool of link targets (batch siblings, then sitemap blog
//! posts, then sitemap resources), asks once for a handful of embeddings, and
//! applies only the ones that pass every local check. A rejected suggestion is
//! recorded, never fatal.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use articleforge_markup::{
    contains_href, escape_attr, find_outside_anchors, hrefs, plain_text,
    replace_once_outside_anchors,
};
use articleforge_shared::{
    ArticleDocument, JobRecord, LinkReport, LinkingConfig, RejectedLink, Result, RetryConfig,
    SitemapIndex, StageName, TextField,
};

use crate::llm::{CallAdapter, CallResponse};
use crate::prompts::{self, LinkItem};
use crate::retry::with_retry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LinkPlan {
    pub links: Vec<LinkSuggestion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LinkSuggestion {
    /// `intro` or `section_<n>_body`.
    pub field: String,
    pub find: String,
    pub replace: String,
    pub url: String,
}

impl CallResponse for LinkPlan {}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub min_links: usize,
    pub max_links: usize,
    pub max_pool: usize,
    pub retry: RetryConfig,
}

impl LinkOptions {
    pub fn new(config: &LinkingConfig, retry: &RetryConfig) -> Self {
        Self {
            min_links: config.min_links,
            max_links: config.max_links,
            max_pool: config.max_pool,
            retry: retry.clone(),
        }
    }
}

/// Where links may point.
#[derive(Debug, Clone, Copy)]
pub struct LinkTargets<'a> {
    /// The document's own canonical path; never linked.
    pub own_path: &'a str,
    /// Every job of the batch, own job included.
    pub siblings: &'a [JobRecord],
    pub sitemap: &'a SitemapIndex,
}

/// One candidate link target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub url: String,
    pub hint: String,
}

#[instrument(skip_all, fields(keyword = %document.keyword, job_id = %document.job_id))]
pub async fn run_link(
    mut document: ArticleDocument,
    targets: LinkTargets<'_>,
    options: &LinkOptions,
    adapter: &CallAdapter,
) -> Result<(ArticleDocument, LinkReport)> {
    let pool = build_pool(targets, options.max_pool);
    let mut report = LinkReport {
        pool_size: pool.len(),
        ..Default::default()
    };
    if pool.is_empty() {
        info!("no link targets, skipping");
        return Ok((document, report));
    }

    let items: Vec<LinkItem<'_>> = pool
        .iter()
        .map(|p| LinkItem {
            url: &p.url,
            hint: &p.hint,
        })
        .collect();
    let prompt = prompts::link(&document, &items, options.min_links, options.max_links);
    let plan = with_retry(&options.retry, StageName::Link, |attempt| {
        adapter.invoke::<LinkPlan>(&prompt, false, attempt.strict)
    })
    .await?;

    report.suggested = plan.links.len();
    let pool_urls: HashSet<&str> = pool.iter().map(|p| p.url.as_str()).collect();
    let mut existing: HashSet<String> = document
        .text_fields()
        .into_iter()
        .filter_map(|f| document.text(f))
        .flat_map(hrefs)
        .collect();
    let mut seen_finds: HashSet<(String, String)> = HashSet::new();

    for link in &plan.links {
        let url = link.url.trim();
        let verdict = check_link(&document, link, url, &pool_urls, &existing, &seen_finds)
            .and_then(|field| {
                if report.applied >= options.max_links {
                    return Err("link limit reached");
                }
                let text = document.text_mut(field).ok_or("inactive field")?;
                *text = replace_once_outside_anchors(text, &link.find, &link.replace)
                    .ok_or("find text not present outside links")?;
                Ok(())
            });

        match verdict {
            Ok(()) => {
                report.applied += 1;
                existing.insert(url.to_string());
                seen_finds.insert((link.field.clone(), link.find.clone()));
            }
            Err(reason) => {
                debug!(field = %link.field, %url, reason, "link rejected");
                report.rejected.push(RejectedLink {
                    field: link.field.clone(),
                    url: url.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    info!(
        pool = report.pool_size,
        suggested = report.suggested,
        applied = report.applied,
        "internal links embedded"
    );
    Ok((document, report))
}

/// Acceptance rules, in order. Returns the target field on success.
fn check_link(
    document: &ArticleDocument,
    link: &LinkSuggestion,
    url: &str,
    pool: &HashSet<&str>,
    existing: &HashSet<String>,
    seen_finds: &HashSet<(String, String)>,
) -> std::result::Result<TextField, &'static str> {
    let field = TextField::parse(&link.field)
        .filter(|f| document.body_fields().contains(f))
        .ok_or("field is not linkable")?;
    if !pool.contains(url) {
        return Err("url is not a candidate");
    }
    if existing.contains(url) {
        return Err("url already linked");
    }
    if seen_finds.contains(&(link.field.clone(), link.find.clone())) {
        return Err("duplicate embedding");
    }
    let text = document.text(field).ok_or("inactive field")?;
    if find_outside_anchors(text, &link.find).is_none() {
        return Err("find text not present outside links");
    }
    if !contains_href(&link.replace, url) && !contains_href(&link.replace, &escape_attr(url)) {
        return Err("replacement does not link the url");
    }
    if plain_text(&link.replace).trim() != plain_text(&link.find).trim() {
        return Err("replacement changes the text");
    }
    Ok(field)
}

/// Ranked, deduplicated candidates: siblings, sitemap blog, sitemap resources.
pub fn build_pool(targets: LinkTargets<'_>, max_pool: usize) -> Vec<PoolEntry> {
    let own = path_key(targets.own_path);
    let mut seen = HashSet::from([own]);
    let mut pool = Vec::new();

    let siblings = targets
        .siblings
        .iter()
        .map(|job| (job.path.clone(), job.keyword.clone()));
    let sitemap = targets
        .sitemap
        .blog
        .iter()
        .chain(&targets.sitemap.resource)
        .map(|url| (url.clone(), slug_hint(url)));

    for (url, hint) in siblings.chain(sitemap) {
        if pool.len() >= max_pool {
            break;
        }
        if url.trim().is_empty() || !seen.insert(path_key(&url)) {
            continue;
        }
        pool.push(PoolEntry { url, hint });
    }
    pool
}

/// Comparable path of an absolute URL or a site-relative path.
fn path_key(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/".into() } else { trimmed.to_ascii_lowercase() }
}

/// Last path segment, dashes to spaces.
fn slug_hint(url: &str) -> String {
    path_key(url)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .replace(['-', '_'], " ")
}
