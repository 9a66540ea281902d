//! Versioned content-quality standards profiles.
//!
//! A profile is plain configuration handed to the generation and refine
//! stages. Its minimums are targets written into prompts and measured
//! afterwards; they never block a document.

use serde::{Deserialize, Serialize};

use crate::error::{ArticleForgeError, Result};

/// Inclusive target range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRange {
    pub min: u32,
    pub max: u32,
}

impl TargetRange {
    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardsProfile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_keyword_mentions")]
    pub keyword_mentions: TargetRange,
    #[serde(default = "default_min_statistics")]
    pub min_statistics: u32,
    #[serde(default = "default_min_case_studies")]
    pub min_case_studies: u32,
    #[serde(default = "default_min_unique_insights")]
    pub min_unique_insights: u32,
    /// Spots in body copy left for the internal-linking stage.
    #[serde(default = "default_min_internal_link_slots")]
    pub min_internal_link_slots: u32,
    #[serde(default = "default_banned_phrases")]
    pub banned_phrases: Vec<String>,
}

impl Default for StandardsProfile {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: default_name(),
            keyword_mentions: default_keyword_mentions(),
            min_statistics: default_min_statistics(),
            min_case_studies: default_min_case_studies(),
            min_unique_insights: default_min_unique_insights(),
            min_internal_link_slots: default_min_internal_link_slots(),
            banned_phrases: default_banned_phrases(),
        }
    }
}

fn default_version() -> String {
    "v1".into()
}
fn default_name() -> String {
    "default".into()
}
fn default_keyword_mentions() -> TargetRange {
    TargetRange { min: 5, max: 8 }
}
fn default_min_statistics() -> u32 {
    15
}
fn default_min_case_studies() -> u32 {
    2
}
fn default_min_unique_insights() -> u32 {
    3
}
fn default_min_internal_link_slots() -> u32 {
    3
}
fn default_banned_phrases() -> Vec<String> {
    [
        "in today's fast-paced world",
        "in today's digital landscape",
        "it's important to note",
        "it is worth noting",
        "delve into",
        "unlock the power",
        "game-changer",
        "in conclusion",
        "navigating the complexities",
        "a testament to",
        "ever-evolving",
        "seamlessly",
        "look no further",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl StandardsProfile {
    pub fn validate(&self) -> Result<()> {
        if self.keyword_mentions.min > self.keyword_mentions.max {
            return Err(ArticleForgeError::config(format!(
                "standards profile {}: keyword_mentions.min ({}) exceeds max ({})",
                self.name, self.keyword_mentions.min, self.keyword_mentions.max
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ArticleForgeError::config(format!(
                "standards profile {} has no version",
                self.name
            )));
        }
        Ok(())
    }

    /// Banned phrases occurring in `text`, case-insensitive.
    pub fn banned_hits(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.banned_phrases
            .iter()
            .filter(|phrase| lower.contains(&phrase.to_lowercase()))
            .cloned()
            .collect()
    }

    /// The targets as prompt text.
    pub fn prompt_block(&self) -> String {
        let mut out = format!(
            "QUALITY TARGETS (standards {} / {}):\n\
             - Mention the primary keyword {}-{} times, naturally.\n\
             - Include at least {} concrete statistics or data points, each with a citation marker.\n\
             - Include at least {} case studies or real-world examples.\n\
             - Offer at least {} insights a reader would not find in a generic article.\n\
             - Leave at least {} natural places in body copy where a related article could be linked.\n",
            self.name,
            self.version,
            self.keyword_mentions.min,
            self.keyword_mentions.max,
            self.min_statistics,
            self.min_case_studies,
            self.min_unique_insights,
            self.min_internal_link_slots,
        );
        if !self.banned_phrases.is_empty() {
            out.push_str("- Never use these phrases: ");
            out.push_str(&self.banned_phrases.join("; "));
            out.push('\n');
        }
        out
    }
}

/// Per-market profile override, `[[standards_overrides]]` in config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardsOverride {
    pub market: String,
    pub profile: StandardsProfile,
}
