//! Merge/assembly: turns the last stage record into the final article.
//!
//! No external calls. Citation markers become anchors pointing at the final
//! sources, the table of contents is derived, blank Q&A pairs are dropped and
//! image results from generation are folded back in.

use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use articleforge_markup::citations::link_markers;
use articleforge_markup::count_words;
use articleforge_shared::{
    ArticleDocument, ArticleForgeError, CallTally, Image, ImageResult, MergeReport, MergedArticle,
    Result, StageEntry, StageName, StageRecord, StageReport,
};

use crate::toc::build_toc;

/// Average reading speed used for the reading-time estimate.
const WORDS_PER_MINUTE: u32 = 200;

#[instrument(skip_all, fields(keyword = %record.job.keyword, job_id = %record.job.job_id))]
pub fn assemble(record: StageRecord) -> Result<(MergedArticle, MergeReport)> {
    record.ensure_after(StageName::Link)?;
    let started = Instant::now();
    let StageRecord {
        job,
        mut document,
        mut history,
        calls,
        ..
    } = record;

    let images_recovered = recover_images(&mut document, &history);
    let citations_linked = link_citations(&mut document)?;
    document.faqs.retain(|qa| !qa.is_blank());
    document.paa.retain(|qa| !qa.is_blank());
    let toc = build_toc(document.sections.as_slice());
    let (word_count, reading_time_minutes) = derive_metrics(&mut document);

    let report = MergeReport {
        citations_linked,
        toc_entries: toc.len(),
        faqs: document.faqs.len(),
        paa: document.paa.len(),
        images: document.images.filled(),
        images_recovered,
        word_count,
        reading_time_minutes,
    };
    history.push(StageEntry {
        stage: StageName::Merge,
        calls: CallTally::default(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        report: StageReport::Merge(report.clone()),
    });

    info!(
        citations = citations_linked,
        toc = report.toc_entries,
        word_count,
        "article assembled"
    );
    let merged = MergedArticle {
        document,
        slug: job.slug,
        path: job.path,
        toc,
        stages: history,
        calls,
        merged_at: Utc::now(),
    };
    Ok((merged, report))
}

/// Resolve every `[n]` marker; a marker without a source is a contract violation.
fn link_citations(document: &mut ArticleDocument) -> Result<usize> {
    let sources = document.sources.as_slice().to_vec();
    let mut linked = 0;
    for field in document.cited_fields() {
        let Some(text) = document.text_mut(field) else {
            continue;
        };
        let (html, count) = link_markers(text, &sources).map_err(|dangling| {
            ArticleForgeError::contract(
                StageName::Merge.as_str(),
                format!("{field} cites [{}] but there are {} sources", dangling.0, sources.len()),
            )
        })?;
        *text = html;
        linked += count;
    }
    Ok(linked)
}

/// Fill empty image slots from successful generation outcomes.
fn recover_images(document: &mut ArticleDocument, history: &[StageEntry]) -> usize {
    let mut recovered = 0;
    let outcomes = history.iter().filter_map(|entry| match &entry.report {
        StageReport::Generate(report) => Some(&report.images),
        _ => None,
    });
    for outcome in outcomes.flatten() {
        if document.images.get(outcome.slot).is_some() {
            continue;
        }
        if let ImageResult::Generated { url, alt } = &outcome.result {
            debug!(slot = %outcome.slot, "image restored from generation outcome");
            document.images.set(
                outcome.slot,
                Image {
                    url: url.clone(),
                    alt: alt.clone(),
                },
            );
            recovered += 1;
        }
    }
    recovered
}

/// Recompute word count and reading time into the document metadata.
pub fn derive_metrics(document: &mut ArticleDocument) -> (u32, u32) {
    let words: usize = document
        .text_fields()
        .into_iter()
        .filter_map(|f| document.text(f))
        .map(count_words)
        .sum();
    let words = u32::try_from(words).unwrap_or(u32::MAX);
    let minutes = words.div_ceil(WORDS_PER_MINUTE).max(1);
    document.meta.word_count = words;
    document.meta.reading_time_minutes = minutes;
    (words, minutes)
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Read a JSON record from disk.
pub fn read_input<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| ArticleForgeError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| ArticleForgeError::parse(format!("{}: {e}", path.display())))
}

/// Write `value` as pretty JSON: temp file in the same directory, then rename.
pub fn write_output<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ArticleForgeError::io(dir, e))?;

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ArticleForgeError::parse(format!("failed to serialize output: {e}")))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.json".into());
    let temp = dir.join(format!(".{name}.tmp"));
    std::fs::write(&temp, json).map_err(|e| ArticleForgeError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| ArticleForgeError::io(path, e))?;
    debug!(path = %path.display(), "output written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use articleforge_shared::{
        ErrorKind, GenerationReport, ImageOutcome, ImageSlot, JobId, JobRecord, LinkReport, QaPair,
        Section, Slots, Source,
    };

    fn job() -> JobRecord {
        JobRecord {
            job_id: JobId::new(),
            keyword: "crm software".into(),
            slug: "crm-software".into(),
            path: "/blog/crm-software".into(),
            word_count: 1500,
            instructions: String::new(),
            language: "en".into(),
            market: "US".into(),
        }
    }

    fn entry(report: StageReport) -> StageEntry {
        let stage = match &report {
            StageReport::Generate(_) => StageName::Generate,
            _ => StageName::Link,
        };
        StageEntry {
            stage,
            calls: CallTally {
                succeeded: 1,
                ..Default::default()
            },
            elapsed_ms: 5,
            report,
        }
    }

    fn record() -> StageRecord {
        let job = job();
        let mut doc = ArticleDocument::new(job.job_id, job.keyword.clone());
        doc.headline = "Choosing CRM Software".into();
        doc.intro = "<p>Most teams outgrow spreadsheets [1].</p>".into();
        doc.sections = Slots::from_vec(vec![
            Section {
                title: "Pricing".into(),
                body: "<p>Plans start at $12 per seat [2].</p>".into(),
            },
            Section {
                title: "Pricing".into(),
                body: "<p>Annual billing saves 20% [1].</p>".into(),
            },
        ])
        .unwrap();
        doc.faqs = Slots::from_vec(vec![
            QaPair {
                question: "Is CRM worth it?".into(),
                answer: "Usually [2].".into(),
            },
            QaPair::default(),
        ])
        .unwrap();
        doc.sources = Slots::from_vec(vec![
            Source {
                title: "Survey".into(),
                url: "https://research.test/survey".into(),
            },
            Source {
                title: "Pricing".into(),
                url: "https://vendor.test/pricing".into(),
            },
        ])
        .unwrap();
        doc.images.set(
            ImageSlot::Hero,
            Image {
                url: "https://img.test/hero.png".into(),
                alt: "hero".into(),
            },
        );

        let generation = GenerationReport {
            images: vec![
                ImageOutcome {
                    slot: ImageSlot::Mid,
                    result: ImageResult::Generated {
                        url: "https://img.test/mid.png".into(),
                        alt: "Pricing".into(),
                    },
                },
                ImageOutcome {
                    slot: ImageSlot::Bottom,
                    result: ImageResult::Failed {
                        kind: ErrorKind::PartialDegradation,
                        message: "model overloaded".into(),
                    },
                },
            ],
            ..Default::default()
        };
        let mut record = StageRecord::new(job, doc);
        record.record(entry(StageReport::Generate(generation)));
        record.record(entry(StageReport::Link(LinkReport::default())));
        record
    }

    #[test]
    fn assembles_citations_toc_and_images() {
        let (merged, report) = assemble(record()).unwrap();

        assert_eq!(
            merged.document.intro,
            "<p>Most teams outgrow spreadsheets <a href=\"https://research.test/survey\" class=\"citation\" target=\"_blank\" rel=\"noopener\">[1]</a>.</p>"
        );
        assert_eq!(report.citations_linked, 4);
        let anchors: Vec<&str> = merged.toc.iter().map(|t| t.anchor.as_str()).collect();
        assert_eq!(anchors, vec!["pricing", "pricing-2"]);
        assert_eq!(report.faqs, 1);
        assert_eq!(merged.document.images.filled(), 2);
        assert_eq!(report.images_recovered, 1);
        assert!(merged.document.images.bottom.is_none());
        assert_eq!(merged.slug, "crm-software");
        assert_eq!(merged.calls.succeeded, 2);
        assert_eq!(merged.stages.last().map(|e| e.stage), Some(StageName::Merge));
        assert_eq!(merged.document.meta.reading_time_minutes, 1);
        assert_eq!(merged.document.meta.word_count, report.word_count);
    }

    #[test]
    fn dangling_marker_is_a_contract_violation() {
        let mut record = record();
        record.document.direct_answer = "CRM centralises contacts [7].".into();
        let err = assemble(record).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(err.stage(), Some("merge"));
    }

    #[test]
    fn records_that_skipped_linking_are_rejected() {
        let mut record = record();
        record.history.pop();
        assert!(assemble(record).is_err());
    }

    #[test]
    fn reading_time_rounds_up() {
        let mut doc = ArticleDocument::new(JobId::new(), "crm");
        doc.intro = format!("<p>{}</p>", vec!["word"; 401].join(" "));
        assert_eq!(derive_metrics(&mut doc), (401, 3));
    }

    #[test]
    fn output_is_written_atomically() {
        let dir = std::env::temp_dir().join(format!("articleforge-merge-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("article.json");
        let (merged, _) = assemble(record()).unwrap();

        write_output(&path, &merged).unwrap();
        let back: MergedArticle = read_input(&path).unwrap();

        assert_eq!(back.document, merged.document);
        assert!(!dir.join("nested").join(".article.json.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
