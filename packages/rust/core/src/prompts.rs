//! Prompt templates for every external call.
//!
//! Each builder returns the full user prompt. Response shapes are carried
//! separately as strict JSON schemas, so prompts describe intent and field
//! semantics, never JSON syntax.

use std::fmt::Write as _;

use articleforge_shared::{
    ArticleDocument, CompanyContext, ImageSlot, JobRecord, QualityAssessment, SharedContext,
    StandardsProfile, TextField,
};

const COMPANY_PROMPT: &str = r#"You are a B2B content strategist. Research the company website below using web search and describe the company as a content team would need to know it.

Fill every field. Use empty strings or empty lists only when the information genuinely cannot be found. Do not invent products, customers or competitors."#;

const ARTICLE_PROMPT: &str = r#"You are a senior content writer producing a long-form, search-optimised blog article. Research the topic with web search and write the complete article in one answer.

STRUCTURE:
- headline: compelling, contains the primary keyword, at most 70 characters
- subtitle: one sentence expanding on the headline
- teaser: two sentences for social previews
- direct_answer: 40-60 words that directly answer the query (featured-snippet style)
- intro: HTML paragraphs (<p>) setting up the problem
- sections: 4-9 sections, each with a plain-text title and an HTML body using <p>, <ul>/<ol>/<li>, <strong>
- key_takeaways: up to 3 one-sentence takeaways
- faqs: up to 6 question/answer pairs; paa: up to 4 "people also ask" pairs
- tables: up to 3 comparison tables where a comparison genuinely helps
- sources: up to 20 cited sources (title + URL) you actually used
- search_queries: the web searches you ran, one per line

CITATIONS:
- Cite facts with numbered markers like [1], [2] placed inside the paragraph, after the sentence they support.
- Marker [n] refers to the n-th entry of sources. Never use a marker without a matching source.

STYLE:
- Write for practitioners. Concrete numbers, named tools, real examples.
- Mention the company naturally where relevant; this is not an advertisement."#;

const REWRITE_PROMPT: &str = r#"You are an editor doing one quality pass over a finished article. Propose find/replace fixes; do not rewrite the article.

RULES:
- field: one of the field names shown in the article below (e.g. intro, section_2_body, faq_1_answer)
- find: an exact substring of that field, copied character for character
- replace: the corrected text
- Keep every number, date, statistic, citation marker and link from the find text in the replacement.
- Fix banned phrases, filler, passive hedging and answer-engine formatting (short direct answers, scannable lists).
- Do not change facts. Propose no fix rather than a risky one."#;

const RELEVANCE_PROMPT: &str = r#"You are a fact-checking editor. For each numbered source below, decide whether the page is topically relevant as a citation in an article about the given topic. Use the page title and description as evidence.

Return one verdict per source number. relevant is false only when the page is clearly about something else (e.g. a homepage, an unrelated product, a login wall)."#;

const REPLACEMENT_PROMPT: &str = r#"You are a research assistant. Each source below can no longer be used in an article (it is dead or off-topic). Use web search to find one authoritative, currently reachable replacement for each.

For each replacement give: the original URL it replaces, the new URL, the name of the publishing organisation, a short contextual anchor text and the reason it is a good replacement. Prefer primary sources, official documentation and reputable research. Skip a source rather than guess a URL."#;

const LINK_PROMPT: &str = r#"You are an SEO editor adding internal links to an article. Choose phrases already present in the article body and turn them into links to the candidate pages below.

RULES:
- field: intro or section_<n>_body
- find: an exact phrase from that field, copied character for character, outside any existing link
- replace: the same phrase wrapped in <a href="URL">...</a>, with no other change to the text
- url: one of the candidate URLs, each used at most once
- Prefer candidates listed first. Only link where the target genuinely helps the reader."#;

const FRESHNESS_PROMPT: &str = r#"You are a fact-checking editor. Today is {today}. Use web search to find statements in the article below that are verifiably outdated: superseded statistics, renamed products, changed prices, past events described as upcoming.

For each outdated statement give: the field name, the exact text to find, its corrected replacement, the reason, and the URL of the source that proves the update. Report only changes you can cite. Keep citation markers and links intact."#;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn company_context(company_url: &str, language: &str, market: &str) -> String {
    format!("{COMPANY_PROMPT}\n\nCompany website: {company_url}\nContent language: {language}\nTarget market: {market}\n")
}

pub fn article(job: &JobRecord, context: &SharedContext, standards: &StandardsProfile) -> String {
    let mut out = format!(
        "{ARTICLE_PROMPT}\n\n{}\nPRIMARY KEYWORD: {}\nTARGET LENGTH: about {} words\nLANGUAGE: {}\nMARKET: {}\n",
        standards.prompt_block(),
        job.keyword,
        job.word_count,
        job.language,
        job.market,
    );
    out.push_str("\nCOMPANY:\n");
    out.push_str(&company_block(&context.company));
    if !job.instructions.trim().is_empty() {
        out.push_str("\nINSTRUCTIONS:\n");
        out.push_str(job.instructions.trim());
        out.push('\n');
    }
    out
}

pub fn image(slot: ImageSlot, keyword: &str, subject: &str, company: &CompanyContext) -> String {
    let framing = match slot {
        ImageSlot::Hero => "a wide hero image that opens the article",
        ImageSlot::Mid => "an explanatory illustration for the middle of the article",
        ImageSlot::Bottom => "a closing image that suggests the next step for the reader",
    };
    let mut out = format!(
        "Create {framing}. Topic: {keyword}. Subject: {subject}. Clean, modern editorial style, no text in the image, no logos."
    );
    if !company.industry.is_empty() {
        let _ = write!(out, " Industry context: {}.", company.industry);
    }
    out
}

pub fn rewrite(
    document: &ArticleDocument,
    standards: &StandardsProfile,
    quality: &QualityAssessment,
    shortfalls: &[String],
) -> String {
    let mut out = format!(
        "{REWRITE_PROMPT}\n\n{}\nPRIMARY KEYWORD: {}\n\nMEASURED: {} words, {} keyword mentions, {} statistics, {} case studies.\n",
        standards.prompt_block(),
        document.keyword,
        quality.word_count,
        quality.keyword_mentions,
        quality.statistics,
        quality.case_studies,
    );
    if !quality.banned_phrase_hits.is_empty() {
        let _ = writeln!(out, "BANNED PHRASES FOUND: {}", quality.banned_phrase_hits.join("; "));
    }
    if !shortfalls.is_empty() {
        let _ = writeln!(out, "SHORTFALLS: {}", shortfalls.join("; "));
    }
    out.push_str("\nARTICLE:\n");
    out.push_str(&field_block(document, &document.text_fields()));
    out
}

/// A source awaiting a relevance verdict.
pub struct RelevanceItem<'a> {
    pub number: usize,
    pub url: &'a str,
    pub title: &'a str,
    pub page_summary: Option<String>,
}

pub fn relevance(keyword: &str, headline: &str, items: &[RelevanceItem<'_>]) -> String {
    let mut out = format!("{RELEVANCE_PROMPT}\n\nTOPIC: {keyword}\nARTICLE: {headline}\n\nSOURCES:\n");
    for item in items {
        let _ = writeln!(
            out,
            "{}. {} ({})\n   page: {}",
            item.number,
            item.title,
            item.url,
            item.page_summary.as_deref().unwrap_or("no title or description"),
        );
    }
    out
}

/// A source that needs a replacement.
pub struct ReplacementItem<'a> {
    pub url: &'a str,
    pub title: &'a str,
    pub problem: &'a str,
}

pub fn replacement(document: &ArticleDocument, items: &[ReplacementItem<'_>]) -> String {
    let mut out = format!(
        "{REPLACEMENT_PROMPT}\n\nTOPIC: {}\nARTICLE: {}\nLANGUAGE: {}\nMARKET: {}\n\nSOURCES TO REPLACE:\n",
        document.keyword, document.headline, document.meta.language, document.meta.market,
    );
    for item in items {
        let _ = writeln!(out, "- {} ({}): {}", item.url, item.title, item.problem);
    }
    out
}

/// One entry of the ranked internal-link pool.
pub struct LinkItem<'a> {
    pub url: &'a str,
    pub hint: &'a str,
}

pub fn link(
    document: &ArticleDocument,
    pool: &[LinkItem<'_>],
    min_links: usize,
    max_links: usize,
) -> String {
    let mut out = format!(
        "{LINK_PROMPT}\n\nAdd between {min_links} and {max_links} links.\nARTICLE TOPIC: {}\n\nCANDIDATES (best first):\n",
        document.keyword
    );
    for item in pool {
        let _ = writeln!(out, "- {} ({})", item.url, item.hint);
    }
    out.push_str("\nARTICLE BODY:\n");
    out.push_str(&field_block(document, &document.body_fields()));
    out
}

pub fn freshness(document: &ArticleDocument, today: &str) -> String {
    let mut out = FRESHNESS_PROMPT.replace("{today}", today);
    let _ = write!(out, "\n\nTOPIC: {}\n\nARTICLE:\n", document.keyword);
    out.push_str(&field_block(document, &document.text_fields()));
    out
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn company_block(company: &CompanyContext) -> String {
    let mut out = String::new();
    let lines = [
        ("Name", company.name.clone()),
        ("Website", company.url.clone()),
        ("Industry", company.industry.clone()),
        ("Description", company.description.clone()),
        ("Products", company.products.join(", ")),
        ("Audience", company.target_audience.clone()),
        ("Tone", company.tone.clone()),
        ("Pain points", company.pain_points.join("; ")),
        ("Value propositions", company.value_propositions.join("; ")),
        ("Competitors (never link or praise)", company.competitors.join(", ")),
    ];
    for (label, value) in lines {
        if !value.trim().is_empty() {
            let _ = writeln!(out, "- {label}: {value}");
        }
    }
    out
}

/// Render fields as `### name` blocks so answers can address them by name.
fn field_block(document: &ArticleDocument, fields: &[TextField]) -> String {
    let mut out = String::new();
    for field in fields {
        if let Some(text) = document.text(*field).filter(|t| !t.trim().is_empty()) {
            let _ = writeln!(out, "### {field}\n{text}\n");
        }
    }
    out
}
