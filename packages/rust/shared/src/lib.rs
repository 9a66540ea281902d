//! Shared contracts, error model, and configuration for articleforge.
//!
//! This crate is the foundation depended on by all other articleforge crates.
//! It provides:
//! - [`ArticleForgeError`] and [`ErrorKind`], the unified error type and failure taxonomy
//! - The article record ([`ArticleDocument`]) built on fixed-capacity [`Slots`]
//! - Per-stage records ([`ContextOutput`], [`StageRecord`], [`MergedArticle`]) and reports
//! - Configuration ([`AppConfig`], [`StandardsProfile`], config loading)

pub mod config;
pub mod document;
pub mod error;
pub mod report;
pub mod slots;
pub mod standards;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, DefaultsConfig, FreshnessConfig, LinkingConfig, OpenRouterConfig,
    RetryConfig, VerificationConfig, config_dir, config_file_path, database_path, expand_home,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use document::{
    ArticleDocument, CURRENT_SCHEMA_VERSION, ComparisonTable, DocField, DocumentMeta, Image,
    ImageSet, ImageSlot, QaPair, Section, Source, TextField,
};
pub use error::{ArticleForgeError, ErrorKind, Result};
pub use report::{
    AppliedUpdate, CallTally, ContextReport, FailureReport, GenerationReport, ImageOutcome,
    ImageResult, LinkReport, MergeReport, QualityAssessment, RefineReport, RefreshReport,
    RejectedLink, Replacement, StageEntry, StageName, StageReport, VerificationResult,
    VerificationStatus, VerifyReport,
};
pub use slots::{SlotState, Slots};
pub use standards::{StandardsOverride, StandardsProfile, TargetRange};
pub use types::{
    BatchId, BatchInput, CompanyContext, ContextOutput, JobId, JobRecord, KeywordSpec,
    MergedArticle, SharedContext, SitemapIndex, StageRecord, TocEntry, UrlCategory,
    check_schema_version,
};
