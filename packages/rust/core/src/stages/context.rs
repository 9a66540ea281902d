//! Stage 1: batch context.
//!
//! Runs once per batch. Resolves every keyword into a [`JobRecord`], derives
//! the company profile (unless supplied) and reads the sitemap index used
//! later as the internal-link pool.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{info, instrument, warn};
use url::Url;

use articleforge_discovery::{DiscoveryOptions, discover_sitemap};
use articleforge_shared::{
    ArticleForgeError, BatchId, BatchInput, CURRENT_SCHEMA_VERSION, CompanyContext,
    ContextOutput, ContextReport, DefaultsConfig, JobId, JobRecord, KeywordSpec, Result,
    RetryConfig, SharedContext, SitemapIndex, StageName,
};

use crate::llm::{CallAdapter, CallResponse};
use crate::prompts;
use crate::retry::with_retry;

/// Separator between batch and keyword instructions.
pub const INSTRUCTION_SEPARATOR: &str = "\n\n---\n\nADDITIONAL INSTRUCTIONS FOR THIS ARTICLE:\n";

const MAX_SLUG_LEN: usize = 80;

// ---------------------------------------------------------------------------
// Sitemap source
// ---------------------------------------------------------------------------

/// Produces the categorised sitemap index of a company site.
#[async_trait]
pub trait SitemapSource: Send + Sync {
    async fn fetch(&self, company_url: &str) -> Result<SitemapIndex>;
}

/// Sitemap retrieval over HTTP via robots.txt and sitemap.xml.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySitemap {
    pub options: DiscoveryOptions,
}

#[async_trait]
impl SitemapSource for DiscoverySitemap {
    async fn fetch(&self, company_url: &str) -> Result<SitemapIndex> {
        let url = Url::parse(company_url)
            .map_err(|e| ArticleForgeError::validation(format!("invalid company_url {company_url}: {e}")))?;
        discover_sitemap(&url, &self.options).await
    }
}

impl CallResponse for CompanyContext {
    fn has_content(&self) -> bool {
        !self.name.trim().is_empty() || !self.description.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub language: String,
    pub market: String,
    pub word_count: u32,
    pub path_prefix: String,
    /// Recorded in the output only.
    pub legal_research: bool,
    pub retry: RetryConfig,
}

impl ContextOptions {
    pub fn new(defaults: &DefaultsConfig, retry: &RetryConfig) -> Self {
        Self {
            language: defaults.language.clone(),
            market: defaults.market.clone(),
            word_count: defaults.word_count,
            path_prefix: defaults.path_prefix.clone(),
            legal_research: true,
            retry: retry.clone(),
        }
    }
}

/// Build the shared context and job list for a batch.
#[instrument(skip_all, fields(keywords = input.keywords.len(), company = %input.company_url))]
pub async fn run_context(
    input: &BatchInput,
    options: &ContextOptions,
    adapter: &CallAdapter,
    sitemap: &dyn SitemapSource,
) -> Result<ContextOutput> {
    input.validate()?;
    let before = adapter.tally();
    let language = non_blank(input.language.as_deref()).unwrap_or(&options.language).to_string();
    let market = non_blank(input.market.as_deref()).unwrap_or(&options.market).to_string();
    let company_url = input.company_url.trim().to_string();

    let mut report = ContextReport {
        company_context_supplied: input.company_context.is_some(),
        ..Default::default()
    };

    let mut company = match &input.company_context {
        Some(supplied) => supplied.clone(),
        None => {
            let prompt = prompts::company_context(&company_url, &language, &market);
            with_retry(&options.retry, StageName::Context, |attempt| {
                adapter.invoke::<CompanyContext>(&prompt, true, attempt.strict)
            })
            .await?
        }
    };
    if company.url.trim().is_empty() {
        company.url = company_url.clone();
    }

    let sitemap_index = if company_url.is_empty() {
        SitemapIndex::default()
    } else {
        match sitemap.fetch(&company_url).await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "sitemap unavailable, continuing with an empty link pool");
                report.sitemap_degraded = Some(e.to_string());
                SitemapIndex::default()
            }
        }
    };
    report.sitemap_urls = sitemap_index.total();

    let batch_word_count = input.word_count.unwrap_or(options.word_count);
    let mut slugs = HashSet::new();
    let jobs: Vec<JobRecord> = input
        .keywords
        .iter()
        .map(|spec| {
            let keyword = spec.keyword().trim().to_string();
            let base = slugify(&keyword);
            let slug = unique_slug(&base, &mut slugs);
            if slug != base {
                report.duplicate_slugs += 1;
            }
            JobRecord {
                job_id: JobId::new(),
                path: format!("{}/{slug}", options.path_prefix.trim_end_matches('/')),
                slug,
                keyword,
                word_count: resolve_word_count(batch_word_count, spec),
                instructions: combine_instructions(input.instructions.as_deref(), spec.instructions()),
                language: language.clone(),
                market: market.clone(),
            }
        })
        .collect();
    report.jobs = jobs.len();

    let calls = adapter.tally().since(&before);
    info!(
        jobs = jobs.len(),
        sitemap_urls = report.sitemap_urls,
        calls = calls.network_calls(),
        "context ready"
    );

    Ok(ContextOutput {
        schema_version: CURRENT_SCHEMA_VERSION,
        batch_id: BatchId::new(),
        context: SharedContext {
            company_url,
            language,
            market,
            company,
            sitemap: sitemap_index,
        },
        jobs,
        report,
        calls,
        legal_research: options.legal_research,
    })
}

// ---------------------------------------------------------------------------
// Resolution rules
// ---------------------------------------------------------------------------

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Batch instructions, then keyword instructions after a separator.
/// Blank-only strings count as absent; present ones are used unchanged.
pub fn combine_instructions(batch: Option<&str>, keyword: Option<&str>) -> String {
    match (present(batch), present(keyword)) {
        (Some(b), Some(k)) => format!("{b}{INSTRUCTION_SEPARATOR}{k}"),
        (Some(only), None) | (None, Some(only)) => only.to_string(),
        (None, None) => String::new(),
    }
}

/// The keyword's own word count replaces the batch default.
pub fn resolve_word_count(batch_default: u32, spec: &KeywordSpec) -> u32 {
    spec.word_count().unwrap_or(batch_default)
}

/// Lowercase ASCII slug: folded accents, runs of other characters as one `-`.
pub fn slugify(keyword: &str) -> String {
    let mut slug = String::with_capacity(keyword.len());
    for c in keyword.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if let Some(folded) = fold(c) {
            slug.push_str(folded);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = truncate_slug(slug.trim_matches('-'), MAX_SLUG_LEN);
    if slug.is_empty() {
        "article".into()
    } else {
        slug
    }
}

fn truncate_slug(slug: &str, max: usize) -> String {
    if slug.len() <= max {
        return slug.to_string();
    }
    slug[..max].trim_end_matches('-').to_string()
}

fn unique_slug(base: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let suffix = format!("-{n}");
        let candidate = format!(
            "{}{suffix}",
            truncate_slug(base, MAX_SLUG_LEN - suffix.len())
        );
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn fold(c: char) -> Option<&'static str> {
    Some(match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ś' | 'š' | 'ş' => "s",
        'ß' => "ss",
        'ť' | 'ţ' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'þ' => "th",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::AdapterConfig;
    use crate::testing::{ScriptedClient, StaticSitemap};
    use articleforge_shared::UrlCategory;
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter(client: Arc<ScriptedClient>) -> CallAdapter {
        CallAdapter::new(
            client,
            AdapterConfig {
                model: "test/model".into(),
                image_model: "test/image".into(),
                timeout: Duration::from_secs(1),
                search_results: 3,
            },
        )
    }

    fn options() -> ContextOptions {
        ContextOptions {
            language: "en".into(),
            market: "US".into(),
            word_count: 2000,
            path_prefix: "/blog".into(),
            legal_research: true,
            retry: RetryConfig {
                base_delay_ms: 1,
                ..RetryConfig::default()
            },
        }
    }

    fn batch(company_context: Option<CompanyContext>) -> BatchInput {
        BatchInput {
            keywords: vec![
                KeywordSpec::Plain("CRM Software".into()),
                KeywordSpec::Detailed {
                    keyword: "crm software!".into(),
                    word_count: Some(1200),
                    instructions: Some("Compare pricing.".into()),
                },
            ],
            company_url: "https://acme.test".into(),
            instructions: Some("Write for founders.".into()),
            company_context,
            ..Default::default()
        }
    }

    fn sitemap() -> StaticSitemap {
        let mut index = SitemapIndex::default();
        index.push(UrlCategory::Blog, "https://acme.test/blog/a".into());
        StaticSitemap(Some(index))
    }

    #[test]
    fn instructions_combine_with_separator() {
        assert_eq!(
            combine_instructions(Some("B"), Some("K")),
            format!("B{INSTRUCTION_SEPARATOR}K")
        );
        assert_eq!(combine_instructions(Some("B"), None), "B");
        assert_eq!(combine_instructions(Some("B"), Some("   ")), "B");
        assert_eq!(combine_instructions(None, Some("K")), "K");
        assert_eq!(combine_instructions(None, None), "");
    }

    #[test]
    fn lone_instructions_keep_their_whitespace() {
        assert_eq!(
            combine_instructions(Some("  Write for founders.\n"), None),
            "  Write for founders.\n"
        );
        assert_eq!(combine_instructions(Some("\t"), Some(" Cite studies. ")), " Cite studies. ");
    }

    #[test]
    fn keyword_word_count_replaces_default() {
        let plain = KeywordSpec::Plain("a".into());
        let detailed = KeywordSpec::Detailed {
            keyword: "b".into(),
            word_count: Some(900),
            instructions: None,
        };
        assert_eq!(resolve_word_count(2000, &plain), 2000);
        assert_eq!(resolve_word_count(2000, &detailed), 900);
    }

    #[test]
    fn slugs_are_ascii_and_bounded() {
        assert_eq!(slugify("Beste CRM-Software für Büros"), "beste-crm-software-fur-buros");
        assert_eq!(slugify("  Straße & Café  "), "strasse-cafe");
        assert_eq!(slugify("!!!"), "article");
        let long = slugify(&"word ".repeat(40));
        assert!(long.len() <= MAX_SLUG_LEN);
        assert!(!long.ends_with('-'));
    }

    #[tokio::test]
    async fn supplied_company_context_makes_no_calls() {
        let client = Arc::new(ScriptedClient::new());
        let adapter = adapter(client.clone());
        let supplied = CompanyContext {
            name: "Acme".into(),
            ..Default::default()
        };

        let output = run_context(&batch(Some(supplied)), &options(), &adapter, &sitemap())
            .await
            .unwrap();

        assert_eq!(client.call_count(), 0);
        assert_eq!(output.calls.network_calls(), 0);
        assert_eq!(output.context.company.url, "https://acme.test");
        assert!(output.report.company_context_supplied);
    }

    #[tokio::test]
    async fn derived_company_context_makes_one_grounded_call() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&CompanyContext {
            name: "Acme".into(),
            description: "CRM for small teams".into(),
            ..Default::default()
        });
        let adapter = adapter(client.clone());

        let output = run_context(&batch(None), &options(), &adapter, &sitemap())
            .await
            .unwrap();

        assert_eq!(client.call_count(), 1);
        assert!(client.calls()[0].grounding.is_some());
        assert_eq!(output.calls.succeeded, 1);
        assert_eq!(output.context.company.name, "Acme");
    }

    #[tokio::test]
    async fn jobs_resolve_slugs_counts_and_instructions() {
        let client = Arc::new(ScriptedClient::new());
        let output = run_context(
            &batch(Some(CompanyContext::default())),
            &options(),
            &adapter(client),
            &sitemap(),
        )
        .await
        .unwrap();

        let [first, second] = output.jobs.as_slice() else {
            panic!("expected two jobs");
        };
        assert_eq!(first.slug, "crm-software");
        assert_eq!(first.path, "/blog/crm-software");
        assert_eq!(first.word_count, 2000);
        assert_eq!(first.instructions, "Write for founders.");
        assert_eq!(second.slug, "crm-software-2");
        assert_eq!(second.word_count, 1200);
        assert_eq!(
            second.instructions,
            format!("Write for founders.{INSTRUCTION_SEPARATOR}Compare pricing.")
        );
        assert_eq!(output.report.duplicate_slugs, 1);
        assert_eq!(output.report.sitemap_urls, 1);
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn sitemap_failure_degrades_to_empty_index() {
        let output = run_context(
            &batch(Some(CompanyContext::default())),
            &options(),
            &adapter(Arc::new(ScriptedClient::new())),
            &StaticSitemap(None),
        )
        .await
        .unwrap();

        assert_eq!(output.context.sitemap.total(), 0);
        assert!(output.report.sitemap_degraded.is_some());
    }

    #[tokio::test]
    async fn empty_company_answer_fails_the_stage() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&CompanyContext::default());
        let err = run_context(&batch(None), &options(), &adapter(client), &sitemap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), articleforge_shared::ErrorKind::PermanentExternal);
        assert_eq!(err.stage(), Some("context"));
    }
}
