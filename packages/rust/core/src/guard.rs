//! Per-stage field ownership.
//!
//! Each stage declares the field groups it may rewrite. The orchestrator
//! fingerprints the document around every stage and rejects changes outside
//! that set as a contract violation.

use std::collections::BTreeMap;

use articleforge_shared::DocField::{self, *};
use articleforge_shared::{ArticleDocument, ArticleForgeError, Result, StageName};

const TEXT: &[DocField] = &[Headline, Subtitle, Teaser, DirectAnswer, Intro, Sections, KeyTakeaways, Faqs, Paa];

/// Field groups `stage` may rewrite.
pub fn write_set(stage: StageName) -> &'static [DocField] {
    match stage {
        StageName::Context => &[],
        StageName::Generate => &[
            Headline, Subtitle, Teaser, DirectAnswer, Intro, Sections, KeyTakeaways, Faqs, Paa,
            Tables, Images, Sources, SearchQueries, Meta,
        ],
        StageName::Refine => TEXT,
        StageName::Verify => &[Sources, DirectAnswer, Intro, Sections, Faqs, Paa],
        StageName::Link => &[Intro, Sections],
        StageName::Merge => &[DirectAnswer, Intro, Sections, Faqs, Paa, Images, Meta],
        StageName::Refresh => &[Headline, Subtitle, Teaser, DirectAnswer, Intro, Sections, KeyTakeaways, Faqs, Paa, Meta],
    }
}

/// Fingerprint taken before a stage runs.
#[derive(Debug, Clone)]
pub struct FieldGuard {
    stage: StageName,
    before: BTreeMap<DocField, String>,
}

impl FieldGuard {
    pub fn capture(stage: StageName, document: &ArticleDocument) -> Self {
        Self {
            stage,
            before: document.fingerprint(),
        }
    }

    /// Fail when `document` changed a field group outside the stage's write-set.
    pub fn check(&self, document: &ArticleDocument) -> Result<()> {
        let allowed = write_set(self.stage);
        let after = document.fingerprint();
        let violations: Vec<String> = self
            .before
            .iter()
            .filter(|&(field, digest)| !allowed.contains(field) && after.get(field) != Some(digest))
            .map(|(field, _)| format!("{field:?}"))
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ArticleForgeError::contract(
                self.stage.as_str(),
                format!("stage modified fields it does not own: {}", violations.join(", ")),
            ))
        }
    }
}
