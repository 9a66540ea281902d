//! Per-stage reports and the external-call tally.

use serde::{Deserialize, Serialize};

use crate::document::ImageSlot;
use crate::error::ErrorKind;
use crate::types::JobId;

// ---------------------------------------------------------------------------
// Stage names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Context,
    Generate,
    Refine,
    Verify,
    Link,
    Merge,
    Refresh,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Generate => "generate",
            Self::Refine => "refine",
            Self::Verify => "verify",
            Self::Link => "link",
            Self::Merge => "merge",
            Self::Refresh => "refresh",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CallTally
// ---------------------------------------------------------------------------

/// External-call accounting for one keyword run (or one stage, as a diff).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallTally {
    /// Invocations that returned a usable parsed result.
    pub succeeded: u32,
    /// Failed invocations that reached the provider and consumed quota.
    pub failed_after_network: u32,
    /// Failed invocations rejected before any network use.
    pub failed_before_network: u32,
    /// Results served from the call cache.
    pub cache_hits: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl CallTally {
    /// Calls that reached the network, successful or not.
    pub fn network_calls(&self) -> u32 {
        self.succeeded + self.failed_after_network
    }

    pub fn add(&mut self, other: &CallTally) {
        self.succeeded += other.succeeded;
        self.failed_after_network += other.failed_after_network;
        self.failed_before_network += other.failed_before_network;
        self.cache_hits += other.cache_hits;
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
    }

    /// Difference between this snapshot and an earlier one.
    pub fn since(&self, earlier: &CallTally) -> CallTally {
        CallTally {
            succeeded: self.succeeded.saturating_sub(earlier.succeeded),
            failed_after_network: self
                .failed_after_network
                .saturating_sub(earlier.failed_after_network),
            failed_before_network: self
                .failed_before_network
                .saturating_sub(earlier.failed_before_network),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            tokens_in: self.tokens_in.saturating_sub(earlier.tokens_in),
            tokens_out: self.tokens_out.saturating_sub(earlier.tokens_out),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextReport {
    pub jobs: usize,
    pub company_context_supplied: bool,
    pub sitemap_urls: usize,
    /// Set when sitemap retrieval failed and an empty index was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sitemap_degraded: Option<String>,
    pub duplicate_slugs: usize,
}

/// Result of one image sub-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageResult {
    Generated { url: String, alt: String },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub slot: ImageSlot,
    #[serde(flatten)]
    pub result: ImageResult,
}

impl ImageOutcome {
    pub fn is_generated(&self) -> bool {
        matches!(self.result, ImageResult::Generated { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationReport {
    pub sections: usize,
    pub faqs: usize,
    pub paa: usize,
    pub tables: usize,
    pub sources: usize,
    pub images_attempted: usize,
    pub images_generated: usize,
    pub images: Vec<ImageOutcome>,
}

/// Measured quality signals for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityAssessment {
    pub word_count: usize,
    pub keyword_mentions: usize,
    pub statistics: usize,
    pub case_studies: usize,
    pub banned_phrase_hits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineReport {
    pub standards_version: String,
    /// Formatting fixes plus applied rewrites.
    pub issues_fixed: usize,
    pub formatting_fixes: usize,
    pub rewrites_suggested: usize,
    pub rewrites_applied: usize,
    pub rewrites_rejected: usize,
    pub quality: QualityAssessment,
    /// Targets the document still misses after the pass; informational only.
    pub shortfalls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Valid,
    Dead,
    Irrelevant,
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub url: String,
    pub source_name: String,
    pub anchor_text: String,
    pub reason: String,
}

/// Per-URL verification log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub url: String,
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<Replacement>,
    /// True when the citation was dropped because nothing acceptable replaced it.
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyReport {
    pub checked: usize,
    pub valid: usize,
    pub dead: usize,
    pub irrelevant: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Sources beyond the per-run bound, left untouched.
    pub unverified: usize,
    pub results: Vec<VerificationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedLink {
    pub field: String,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkReport {
    pub pool_size: usize,
    pub suggested: usize,
    pub applied: usize,
    pub rejected: Vec<RejectedLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeReport {
    pub citations_linked: usize,
    pub toc_entries: usize,
    pub faqs: usize,
    pub paa: usize,
    pub images: usize,
    /// Image slots restored from generation outcomes.
    pub images_recovered: usize,
    pub word_count: u32,
    pub reading_time_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedUpdate {
    pub field: String,
    pub find: String,
    pub replace: String,
    pub reason: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshReport {
    pub enabled: bool,
    pub suggested: usize,
    pub applied: Vec<AppliedUpdate>,
    pub skipped: usize,
}

/// Report of any stage, tagged by stage name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    Context(ContextReport),
    Generate(GenerationReport),
    Refine(RefineReport),
    Verify(VerifyReport),
    Link(LinkReport),
    Merge(MergeReport),
    Refresh(RefreshReport),
}

/// One completed stage in a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: StageName,
    pub calls: CallTally,
    pub elapsed_ms: u64,
    pub report: StageReport,
}

/// Structured failure for one keyword run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub calls: CallTally,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_since_diffs_snapshots() {
        let before = CallTally {
            succeeded: 2,
            tokens_in: 100,
            ..Default::default()
        };
        let after = CallTally {
            succeeded: 3,
            failed_after_network: 1,
            tokens_in: 250,
            ..Default::default()
        };
        let diff = after.since(&before);
        assert_eq!(diff.succeeded, 1);
        assert_eq!(diff.failed_after_network, 1);
        assert_eq!(diff.tokens_in, 150);
        assert_eq!(diff.network_calls(), 2);
    }

    #[test]
    fn stage_report_is_tagged() {
        let report = StageReport::Link(LinkReport {
            pool_size: 4,
            suggested: 6,
            applied: 3,
            rejected: vec![],
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stage"], "link");
        assert_eq!(json["applied"], 3);

        let back: StageReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn image_outcome_shapes() {
        let ok = ImageOutcome {
            slot: ImageSlot::Hero,
            result: ImageResult::Generated {
                url: "https://img/h.png".into(),
                alt: "hero".into(),
            },
        };
        let failed = ImageOutcome {
            slot: ImageSlot::Mid,
            result: ImageResult::Failed {
                kind: ErrorKind::TransientExternal,
                message: "timeout".into(),
            },
        };
        assert!(ok.is_generated());
        assert!(!failed.is_generated());

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["slot"], "mid");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "transient_external");
    }
}
