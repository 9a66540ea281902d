//! Table of contents derived from section titles.
//!
//! Anchors are slugs of the titles, unique within the article: a repeated
//! title gets `-2`, `-3`, ... appended in order of appearance.

use std::collections::HashSet;

use tracing::{debug, instrument};

use articleforge_shared::{Section, TocEntry};

use crate::stages::context::slugify;

#[instrument(skip_all, fields(sections = sections.len()))]
pub fn build_toc(sections: &[Section]) -> Vec<TocEntry> {
    let mut taken = HashSet::new();
    let toc: Vec<TocEntry> = sections
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.title.trim().is_empty())
        .map(|(i, section)| {
            let title = section.title.trim().to_string();
            let base = if title.chars().any(char::is_alphanumeric) {
                slugify(&title)
            } else {
                format!("section-{}", i + 1)
            };
            TocEntry {
                anchor: unique_anchor(base, &mut taken),
                title,
            }
        })
        .collect();
    debug!(entries = toc.len(), "toc built");
    toc
}

fn unique_anchor(base: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.clone()) {
        return base;
    }
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| taken.insert(candidate.clone()))
        .unwrap_or(base)
}
