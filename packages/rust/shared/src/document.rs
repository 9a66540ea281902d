//! The canonical article record passed through every stage.
//!
//! Every field defaults to an empty value so a stage can always operate on a
//! document whose later-stage fields are not populated yet. Bounded
//! collections use [`Slots`]; unfilled slots are inactive, never `null`.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::slots::Slots;
use crate::types::JobId;

/// Current schema version of every stage record.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const MAX_SECTIONS: usize = 9;
pub const MAX_TAKEAWAYS: usize = 3;
pub const MAX_FAQS: usize = 6;
pub const MAX_PAA: usize = 4;
pub const MAX_TABLES: usize = 3;
pub const MAX_SOURCES: usize = 20;

// ---------------------------------------------------------------------------
// Content records
// ---------------------------------------------------------------------------

/// One titled body section. `body` is an HTML fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Section {
    pub title: String,
    pub body: String,
}

/// A question/answer pair (FAQ or "people also ask").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

impl QaPair {
    /// Blank pairs are inactive slots the generator left empty.
    pub fn is_blank(&self) -> bool {
        self.question.trim().is_empty() || self.answer.trim().is_empty()
    }
}

/// A comparison table: title, header row, body rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ComparisonTable {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// A cited source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Source {
    pub title: String,
    pub url: String,
}

/// Placement slot of a generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSlot {
    Hero,
    Mid,
    Bottom,
}

impl ImageSlot {
    pub const ALL: [ImageSlot; 3] = [ImageSlot::Hero, ImageSlot::Mid, ImageSlot::Bottom];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hero => "hero",
            Self::Mid => "mid",
            Self::Bottom => "bottom",
        }
    }
}

impl std::fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub alt: String,
}

/// The three image placement slots; each may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hero: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottom: Option<Image>,
}

impl ImageSet {
    pub fn get(&self, slot: ImageSlot) -> Option<&Image> {
        match slot {
            ImageSlot::Hero => self.hero.as_ref(),
            ImageSlot::Mid => self.mid.as_ref(),
            ImageSlot::Bottom => self.bottom.as_ref(),
        }
    }

    pub fn set(&mut self, slot: ImageSlot, image: Image) {
        match slot {
            ImageSlot::Hero => self.hero = Some(image),
            ImageSlot::Mid => self.mid = Some(image),
            ImageSlot::Bottom => self.bottom = Some(image),
        }
    }

    /// Number of filled slots.
    pub fn filled(&self) -> usize {
        ImageSlot::ALL.iter().filter(|s| self.get(**s).is_some()).count()
    }
}

/// Language/market targeting and computed metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentMeta {
    pub language: String,
    pub market: String,
    pub target_word_count: u32,
    /// Computed at merge time.
    pub word_count: u32,
    /// Computed at merge time.
    pub reading_time_minutes: u32,
}

// ---------------------------------------------------------------------------
// ArticleDocument
// ---------------------------------------------------------------------------

/// The evolving article record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArticleDocument {
    pub schema_version: u32,
    pub job_id: JobId,
    pub keyword: String,

    pub headline: String,
    pub subtitle: String,
    pub teaser: String,
    pub direct_answer: String,
    pub intro: String,
    pub sections: Slots<Section, MAX_SECTIONS>,
    pub key_takeaways: Slots<String, MAX_TAKEAWAYS>,
    pub faqs: Slots<QaPair, MAX_FAQS>,
    pub paa: Slots<QaPair, MAX_PAA>,
    pub tables: Slots<ComparisonTable, MAX_TABLES>,
    pub images: ImageSet,
    pub sources: Slots<Source, MAX_SOURCES>,
    pub search_queries: String,

    pub meta: DocumentMeta,
}

/// Top-level field groups, the unit of stage write permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocField {
    Identity,
    Headline,
    Subtitle,
    Teaser,
    DirectAnswer,
    Intro,
    Sections,
    KeyTakeaways,
    Faqs,
    Paa,
    Tables,
    Images,
    Sources,
    SearchQueries,
    Meta,
}

impl DocField {
    pub const ALL: [DocField; 15] = [
        DocField::Identity,
        DocField::Headline,
        DocField::Subtitle,
        DocField::Teaser,
        DocField::DirectAnswer,
        DocField::Intro,
        DocField::Sections,
        DocField::KeyTakeaways,
        DocField::Faqs,
        DocField::Paa,
        DocField::Tables,
        DocField::Images,
        DocField::Sources,
        DocField::SearchQueries,
        DocField::Meta,
    ];
}

/// Address of a single text field, e.g. `intro` or `section_3_body` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextField {
    Headline,
    Subtitle,
    Teaser,
    DirectAnswer,
    Intro,
    SectionTitle(usize),
    SectionBody(usize),
    Takeaway(usize),
    FaqQuestion(usize),
    FaqAnswer(usize),
    PaaQuestion(usize),
    PaaAnswer(usize),
}

impl TextField {
    /// Parse a field name as used in prompts and LLM responses.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        match name {
            "headline" => return Some(Self::Headline),
            "subtitle" => return Some(Self::Subtitle),
            "teaser" => return Some(Self::Teaser),
            "direct_answer" => return Some(Self::DirectAnswer),
            "intro" => return Some(Self::Intro),
            _ => {}
        }

        let mut parts = name.splitn(3, '_');
        let group = parts.next()?;
        let index: usize = parts.next()?.parse().ok()?;
        let part = parts.next().unwrap_or("");
        if index == 0 {
            return None;
        }
        match (group, part) {
            ("section", "title") => Some(Self::SectionTitle(index)),
            ("section", "body") => Some(Self::SectionBody(index)),
            ("takeaway", "") => Some(Self::Takeaway(index)),
            ("faq", "question") => Some(Self::FaqQuestion(index)),
            ("faq", "answer") => Some(Self::FaqAnswer(index)),
            ("paa", "question") => Some(Self::PaaQuestion(index)),
            ("paa", "answer") => Some(Self::PaaAnswer(index)),
            _ => None,
        }
    }

    /// The field group this text lives in.
    pub fn doc_field(self) -> DocField {
        match self {
            Self::Headline => DocField::Headline,
            Self::Subtitle => DocField::Subtitle,
            Self::Teaser => DocField::Teaser,
            Self::DirectAnswer => DocField::DirectAnswer,
            Self::Intro => DocField::Intro,
            Self::SectionTitle(_) | Self::SectionBody(_) => DocField::Sections,
            Self::Takeaway(_) => DocField::KeyTakeaways,
            Self::FaqQuestion(_) | Self::FaqAnswer(_) => DocField::Faqs,
            Self::PaaQuestion(_) | Self::PaaAnswer(_) => DocField::Paa,
        }
    }

    /// Body fields carry citation markers and may receive links.
    pub fn is_body(self) -> bool {
        matches!(self, Self::Intro | Self::SectionBody(_))
    }
}

impl std::fmt::Display for TextField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Headline => f.write_str("headline"),
            Self::Subtitle => f.write_str("subtitle"),
            Self::Teaser => f.write_str("teaser"),
            Self::DirectAnswer => f.write_str("direct_answer"),
            Self::Intro => f.write_str("intro"),
            Self::SectionTitle(i) => write!(f, "section_{i}_title"),
            Self::SectionBody(i) => write!(f, "section_{i}_body"),
            Self::Takeaway(i) => write!(f, "takeaway_{i}"),
            Self::FaqQuestion(i) => write!(f, "faq_{i}_question"),
            Self::FaqAnswer(i) => write!(f, "faq_{i}_answer"),
            Self::PaaQuestion(i) => write!(f, "paa_{i}_question"),
            Self::PaaAnswer(i) => write!(f, "paa_{i}_answer"),
        }
    }
}

impl ArticleDocument {
    /// Empty document for a job, as created by the context stage.
    pub fn new(job_id: JobId, keyword: impl Into<String>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            job_id,
            keyword: keyword.into(),
            ..Default::default()
        }
    }

    pub fn text(&self, field: TextField) -> Option<&str> {
        let s = match field {
            TextField::Headline => &self.headline,
            TextField::Subtitle => &self.subtitle,
            TextField::Teaser => &self.teaser,
            TextField::DirectAnswer => &self.direct_answer,
            TextField::Intro => &self.intro,
            TextField::SectionTitle(i) => &self.sections.get(i.checked_sub(1)?)?.title,
            TextField::SectionBody(i) => &self.sections.get(i.checked_sub(1)?)?.body,
            TextField::Takeaway(i) => self.key_takeaways.get(i.checked_sub(1)?)?,
            TextField::FaqQuestion(i) => &self.faqs.get(i.checked_sub(1)?)?.question,
            TextField::FaqAnswer(i) => &self.faqs.get(i.checked_sub(1)?)?.answer,
            TextField::PaaQuestion(i) => &self.paa.get(i.checked_sub(1)?)?.question,
            TextField::PaaAnswer(i) => &self.paa.get(i.checked_sub(1)?)?.answer,
        };
        Some(s.as_str())
    }

    /// Mutable access to one text field; `None` when the slot is inactive.
    pub fn text_mut(&mut self, field: TextField) -> Option<&mut String> {
        match field {
            TextField::Headline => Some(&mut self.headline),
            TextField::Subtitle => Some(&mut self.subtitle),
            TextField::Teaser => Some(&mut self.teaser),
            TextField::DirectAnswer => Some(&mut self.direct_answer),
            TextField::Intro => Some(&mut self.intro),
            TextField::SectionTitle(i) => Some(&mut self.sections.get_mut(i.checked_sub(1)?)?.title),
            TextField::SectionBody(i) => Some(&mut self.sections.get_mut(i.checked_sub(1)?)?.body),
            TextField::Takeaway(i) => self.key_takeaways.get_mut(i.checked_sub(1)?),
            TextField::FaqQuestion(i) => Some(&mut self.faqs.get_mut(i.checked_sub(1)?)?.question),
            TextField::FaqAnswer(i) => Some(&mut self.faqs.get_mut(i.checked_sub(1)?)?.answer),
            TextField::PaaQuestion(i) => Some(&mut self.paa.get_mut(i.checked_sub(1)?)?.question),
            TextField::PaaAnswer(i) => Some(&mut self.paa.get_mut(i.checked_sub(1)?)?.answer),
        }
    }

    /// All active text fields in reading order.
    pub fn text_fields(&self) -> Vec<TextField> {
        let mut fields = vec![
            TextField::Headline,
            TextField::Subtitle,
            TextField::Teaser,
            TextField::DirectAnswer,
            TextField::Intro,
        ];
        for i in 1..=self.sections.len() {
            fields.push(TextField::SectionTitle(i));
            fields.push(TextField::SectionBody(i));
        }
        fields.extend((1..=self.key_takeaways.len()).map(TextField::Takeaway));
        for i in 1..=self.faqs.len() {
            fields.push(TextField::FaqQuestion(i));
            fields.push(TextField::FaqAnswer(i));
        }
        for i in 1..=self.paa.len() {
            fields.push(TextField::PaaQuestion(i));
            fields.push(TextField::PaaAnswer(i));
        }
        fields
    }

    /// Intro plus every section body, the fields that carry citation markers.
    pub fn body_fields(&self) -> Vec<TextField> {
        let mut fields = vec![TextField::Intro];
        fields.extend((1..=self.sections.len()).map(TextField::SectionBody));
        fields
    }

    /// Fields that may carry citation markers.
    pub fn cited_fields(&self) -> Vec<TextField> {
        let mut fields = vec![TextField::DirectAnswer, TextField::Intro];
        fields.extend((1..=self.sections.len()).map(TextField::SectionBody));
        fields.extend((1..=self.faqs.len()).map(TextField::FaqAnswer));
        fields.extend((1..=self.paa.len()).map(TextField::PaaAnswer));
        fields
    }

    /// Per-field-group content hashes, used to check stage write permissions.
    pub fn fingerprint(&self) -> BTreeMap<DocField, String> {
        fn hash<T: Serialize + ?Sized>(value: &T) -> String {
            let bytes = serde_json::to_vec(value).unwrap_or_default();
            format!("{:x}", Sha256::digest(&bytes))
        }

        DocField::ALL
            .iter()
            .map(|field| {
                let digest = match field {
                    DocField::Identity => hash(&(&self.job_id, &self.keyword)),
                    DocField::Headline => hash(&self.headline),
                    DocField::Subtitle => hash(&self.subtitle),
                    DocField::Teaser => hash(&self.teaser),
                    DocField::DirectAnswer => hash(&self.direct_answer),
                    DocField::Intro => hash(&self.intro),
                    DocField::Sections => hash(&self.sections),
                    DocField::KeyTakeaways => hash(&self.key_takeaways),
                    DocField::Faqs => hash(&self.faqs),
                    DocField::Paa => hash(&self.paa),
                    DocField::Tables => hash(&self.tables),
                    DocField::Images => hash(&self.images),
                    DocField::Sources => hash(&self.sources),
                    DocField::SearchQueries => hash(&self.search_queries),
                    DocField::Meta => hash(&self.meta),
                };
                (*field, digest)
            })
            .collect()
    }
}
