//! Batch, job and stage-record types: the per-stage JSON contracts.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{ArticleDocument, CURRENT_SCHEMA_VERSION};
use crate::error::{ArticleForgeError, Result};
use crate::report::{CallTally, ContextReport, StageEntry, StageName};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 identifier for one keyword run (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A UUID v7 identifier for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Batch input
// ---------------------------------------------------------------------------

/// One keyword in a batch: a bare string or an object with overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordSpec {
    Plain(String),
    Detailed {
        keyword: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

impl KeywordSpec {
    pub fn keyword(&self) -> &str {
        match self {
            Self::Plain(k) => k,
            Self::Detailed { keyword, .. } => keyword,
        }
    }

    pub fn word_count(&self) -> Option<u32> {
        match self {
            Self::Plain(_) => None,
            Self::Detailed { word_count, .. } => *word_count,
        }
    }

    pub fn instructions(&self) -> Option<&str> {
        match self {
            Self::Plain(_) => None,
            Self::Detailed { instructions, .. } => instructions.as_deref(),
        }
    }
}

/// The batch input file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchInput {
    pub keywords: Vec<KeywordSpec>,
    pub company_url: String,
    /// Falls back to `[defaults].language`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Falls back to `[defaults].market`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    /// Batch default word count; falls back to `[defaults].word_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Pre-supplied company profile; skips the extraction call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_context: Option<CompanyContext>,
}

impl BatchInput {
    pub fn validate(&self) -> Result<()> {
        if self.keywords.is_empty() {
            return Err(ArticleForgeError::validation("batch has no keywords"));
        }
        if let Some(spec) = self.keywords.iter().find(|k| k.keyword().trim().is_empty()) {
            return Err(ArticleForgeError::validation(format!(
                "blank keyword in batch: {spec:?}"
            )));
        }
        if self.company_url.trim().is_empty() && self.company_context.is_none() {
            return Err(ArticleForgeError::validation(
                "company_url is required when no company_context is supplied",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Company profile used as prompt material by every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CompanyContext {
    pub name: String,
    pub url: String,
    pub industry: String,
    pub description: String,
    pub products: Vec<String>,
    pub target_audience: String,
    pub competitors: Vec<String>,
    pub tone: String,
    pub pain_points: Vec<String>,
    pub value_propositions: Vec<String>,
    pub use_cases: Vec<String>,
    pub content_themes: Vec<String>,
}

/// Category of a sitemap URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlCategory {
    Blog,
    Product,
    Service,
    Docs,
    Resource,
    Company,
    Legal,
    Contact,
    Landing,
    Other,
}

/// Categorised sitemap URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SitemapIndex {
    pub blog: Vec<String>,
    pub product: Vec<String>,
    pub service: Vec<String>,
    pub docs: Vec<String>,
    pub resource: Vec<String>,
    pub company: Vec<String>,
    pub legal: Vec<String>,
    pub contact: Vec<String>,
    pub landing: Vec<String>,
    pub other: Vec<String>,
}

impl SitemapIndex {
    pub fn urls(&self, category: UrlCategory) -> &[String] {
        match category {
            UrlCategory::Blog => &self.blog,
            UrlCategory::Product => &self.product,
            UrlCategory::Service => &self.service,
            UrlCategory::Docs => &self.docs,
            UrlCategory::Resource => &self.resource,
            UrlCategory::Company => &self.company,
            UrlCategory::Legal => &self.legal,
            UrlCategory::Contact => &self.contact,
            UrlCategory::Landing => &self.landing,
            UrlCategory::Other => &self.other,
        }
    }

    /// Add a URL under `category`, ignoring exact duplicates.
    pub fn push(&mut self, category: UrlCategory, url: String) {
        let list = match category {
            UrlCategory::Blog => &mut self.blog,
            UrlCategory::Product => &mut self.product,
            UrlCategory::Service => &mut self.service,
            UrlCategory::Docs => &mut self.docs,
            UrlCategory::Resource => &mut self.resource,
            UrlCategory::Company => &mut self.company,
            UrlCategory::Legal => &mut self.legal,
            UrlCategory::Contact => &mut self.contact,
            UrlCategory::Landing => &mut self.landing,
            UrlCategory::Other => &mut self.other,
        };
        if !list.contains(&url) {
            list.push(url);
        }
    }

    pub fn total(&self) -> usize {
        self.blog.len()
            + self.product.len()
            + self.service.len()
            + self.docs.len()
            + self.resource.len()
            + self.company.len()
            + self.legal.len()
            + self.contact.len()
            + self.landing.len()
            + self.other.len()
    }
}

/// Read-only context shared by every keyword run in a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedContext {
    pub company_url: String,
    pub language: String,
    pub market: String,
    pub company: CompanyContext,
    pub sitemap: SitemapIndex,
}

// ---------------------------------------------------------------------------
// Jobs and stage records
// ---------------------------------------------------------------------------

/// One resolved keyword job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub keyword: String,
    pub slug: String,
    /// Canonical path, e.g. `/blog/rust-async`.
    pub path: String,
    pub word_count: u32,
    /// Resolved instructions; empty when neither batch nor keyword gave any.
    #[serde(default)]
    pub instructions: String,
    pub language: String,
    pub market: String,
}

/// Output of the context stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOutput {
    pub schema_version: u32,
    pub batch_id: BatchId,
    pub context: SharedContext,
    pub jobs: Vec<JobRecord>,
    #[serde(default)]
    pub report: ContextReport,
    #[serde(default)]
    pub calls: CallTally,
    /// Recorded only; legal research is not performed.
    #[serde(default)]
    pub legal_research: bool,
}

impl ContextOutput {
    pub fn check_version(&self) -> Result<()> {
        check_schema_version(self.schema_version)
    }

    /// Find a job by zero-based index or by exact keyword.
    pub fn find_job(&self, selector: &str) -> Option<&JobRecord> {
        if let Ok(index) = selector.parse::<usize>() {
            return self.jobs.get(index);
        }
        self.jobs.iter().find(|job| job.keyword == selector)
    }
}

/// The record every per-keyword stage (generate through link) reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub schema_version: u32,
    pub job: JobRecord,
    pub document: ArticleDocument,
    #[serde(default)]
    pub history: Vec<StageEntry>,
    #[serde(default)]
    pub calls: CallTally,
}

impl StageRecord {
    pub fn new(job: JobRecord, document: ArticleDocument) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            job,
            document,
            history: Vec::new(),
            calls: CallTally::default(),
        }
    }

    pub fn last_stage(&self) -> Option<StageName> {
        self.history.last().map(|entry| entry.stage)
    }

    /// Reject records from a newer schema or records not produced by `stage`.
    pub fn ensure_after(&self, stage: StageName) -> Result<()> {
        check_schema_version(self.schema_version)?;
        if self.history.iter().any(|entry| entry.stage == stage) {
            Ok(())
        } else {
            Err(ArticleForgeError::validation(format!(
                "input record has not been through the {stage} stage (last: {})",
                self.last_stage()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".into())
            )))
        }
    }

    /// Append a stage entry and fold its calls into the running tally.
    pub fn record(&mut self, entry: StageEntry) {
        self.calls.add(&entry.calls);
        self.history.push(entry);
    }
}

/// One table-of-contents entry, derived from a section title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    /// Unique in-page anchor id.
    pub anchor: String,
}

/// The final, fully resolved article handed to exporters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedArticle {
    #[serde(flatten)]
    pub document: ArticleDocument,
    pub slug: String,
    pub path: String,
    #[serde(default)]
    pub toc: Vec<TocEntry>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
    #[serde(default)]
    pub calls: CallTally,
    pub merged_at: DateTime<Utc>,
}

impl MergedArticle {
    pub fn check_version(&self) -> Result<()> {
        check_schema_version(self.document.schema_version)
    }
}

/// Accept any version up to the current one; older records only lack optional fields.
pub fn check_schema_version(version: u32) -> Result<()> {
    if version > CURRENT_SCHEMA_VERSION {
        return Err(ArticleForgeError::validation(format!(
            "unsupported schema_version {version} (this build reads up to {CURRENT_SCHEMA_VERSION})"
        )));
    }
    Ok(())
}
