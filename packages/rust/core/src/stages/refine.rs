//! Stage 3: quality refinement.
//!
//! Always runs, exactly once per document:
//! 1. deterministic formatting passes over the body fields
//! 2. quality assessment against the standards profile
//! 3. one rewrite call returning find/replace fixes
//!
//! A fix is applied only when its text is found in the named field outside
//! markup and the replacement keeps every number of the original. Targets
//! the document still misses are reported as shortfalls; they never block it.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use articleforge_markup::{
    adds_anchor, count_case_studies, count_phrase, count_statistics, count_words, numbers_in,
    plain_text, replace_once_outside_anchors, run_passes,
};
use articleforge_shared::{
    ArticleDocument, QualityAssessment, RefineReport, Result, RetryConfig, StageName,
    StandardsProfile, TextField,
};

use crate::llm::{CallAdapter, CallResponse};
use crate::prompts;
use crate::retry::with_retry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RewritePlan {
    pub fixes: Vec<RewriteFix>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RewriteFix {
    /// Field name such as `intro` or `section_2_body`.
    pub field: String,
    pub find: String,
    pub replace: String,
    pub reason: String,
}

/// An empty fix list is a valid answer: nothing needed changing.
impl CallResponse for RewritePlan {}

#[derive(Debug, Clone)]
pub struct RefineOptions {
    pub retry: RetryConfig,
    pub standards: StandardsProfile,
}

#[instrument(skip_all, fields(keyword = %document.keyword, job_id = %document.job_id, standards = %options.standards.version))]
pub async fn run_refine(
    mut document: ArticleDocument,
    options: &RefineOptions,
    adapter: &CallAdapter,
) -> Result<(ArticleDocument, RefineReport)> {
    let standards = &options.standards;
    let formatting_fixes = apply_cleanup(&mut document);

    let before = assess(&document, standards);
    let before_shortfalls = shortfalls(&before, standards);
    let prompt = prompts::rewrite(&document, standards, &before, &before_shortfalls);
    let plan = with_retry(&options.retry, StageName::Refine, |attempt| {
        adapter.invoke::<RewritePlan>(&prompt, false, attempt.strict)
    })
    .await?;

    let suggested = plan.fixes.len();
    let mut applied = 0;
    for fix in &plan.fixes {
        match apply_fix(&mut document, fix) {
            Ok(()) => applied += 1,
            Err(reason) => debug!(field = %fix.field, reason, "rewrite rejected"),
        }
    }

    let quality = assess(&document, standards);
    let report = RefineReport {
        standards_version: standards.version.clone(),
        issues_fixed: formatting_fixes + applied,
        formatting_fixes,
        rewrites_suggested: suggested,
        rewrites_applied: applied,
        rewrites_rejected: suggested - applied,
        shortfalls: shortfalls(&quality, standards),
        quality,
    };
    info!(
        issues_fixed = report.issues_fixed,
        rewrites_applied = applied,
        shortfalls = report.shortfalls.len(),
        "refine pass complete"
    );
    Ok((document, report))
}

/// Run the formatting passes over every body field; returns the fix count.
fn apply_cleanup(document: &mut ArticleDocument) -> usize {
    let mut fixes = 0;
    for field in document.body_fields() {
        if let Some(text) = document.text_mut(field) {
            let outcome = run_passes(text);
            if outcome.fixes > 0 {
                fixes += outcome.fixes;
                *text = outcome.html;
            }
        }
    }
    fixes
}

/// Measure the document against the profile.
pub fn assess(document: &ArticleDocument, standards: &StandardsProfile) -> QualityAssessment {
    let fields = document.text_fields();
    let texts: Vec<&str> = fields.iter().filter_map(|f| document.text(*f)).collect();
    let word_count = texts.iter().map(|t| count_words(t)).sum();
    let plain = texts
        .iter()
        .map(|t| plain_text(t))
        .collect::<Vec<_>>()
        .join("\n");

    QualityAssessment {
        word_count,
        keyword_mentions: count_phrase(&plain, &document.keyword),
        statistics: count_statistics(&plain),
        case_studies: count_case_studies(&plain),
        banned_phrase_hits: standards.banned_hits(&plain),
    }
}

/// Targets the assessment misses, as readable notes.
pub fn shortfalls(quality: &QualityAssessment, standards: &StandardsProfile) -> Vec<String> {
    let mut out = Vec::new();
    let mentions = quality.keyword_mentions as u32;
    if !standards.keyword_mentions.contains(mentions) {
        out.push(format!(
            "keyword mentioned {mentions} times (target {}-{})",
            standards.keyword_mentions.min, standards.keyword_mentions.max
        ));
    }
    if (quality.statistics as u32) < standards.min_statistics {
        out.push(format!(
            "{} statistics (target at least {})",
            quality.statistics, standards.min_statistics
        ));
    }
    if (quality.case_studies as u32) < standards.min_case_studies {
        out.push(format!(
            "{} case studies (target at least {})",
            quality.case_studies, standards.min_case_studies
        ));
    }
    if !quality.banned_phrase_hits.is_empty() {
        out.push(format!(
            "banned phrases present: {}",
            quality.banned_phrase_hits.join(", ")
        ));
    }
    out
}

/// Apply one fix, or say why it was rejected.
fn apply_fix(document: &mut ArticleDocument, fix: &RewriteFix) -> std::result::Result<(), &'static str> {
    let field = TextField::parse(&fix.field).ok_or("unknown field")?;
    if fix.find.trim().is_empty() || fix.find == fix.replace {
        return Err("empty or no-op fix");
    }
    if !keeps_numbers(&fix.find, &fix.replace) {
        return Err("replacement drops or alters a number");
    }
    if adds_anchor(&fix.find, &fix.replace) {
        return Err("replacement adds link markup");
    }
    let text = document.text_mut(field).ok_or("inactive field")?;
    let updated =
        replace_once_outside_anchors(text, &fix.find, &fix.replace).ok_or("find text not present")?;
    *text = updated;
    Ok(())
}

/// Every number token of `original` still occurs in `replacement`, with multiplicity.
fn keeps_numbers(original: &str, replacement: &str) -> bool {
    let mut available: HashMap<String, usize> = HashMap::new();
    for n in numbers_in(replacement) {
        *available.entry(n).or_default() += 1;
    }
    numbers_in(original).into_iter().all(|n| match available.get_mut(&n) {
        Some(count) if *count > 0 => {
            *count -= 1;
            true
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AdapterConfig, CallFailure};
    use crate::testing::ScriptedClient;
    use articleforge_shared::{ErrorKind, JobId, Section};
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

    fn options() -> RefineOptions {
        RefineOptions {
            retry: RetryConfig {
                base_delay_ms: 1,
                ..RetryConfig::default()
            },
            standards: StandardsProfile::default(),
        }
    }

    fn document() -> ArticleDocument {
        let mut doc = ArticleDocument::new(JobId::new(), "crm software");
        doc.headline = "CRM software in 2026".into();
        doc.intro = "<p>Let us delve into CRM software. It is **essential**.</p>".into();
        doc.sections
            .try_push(Section {
                title: "Pricing".into(),
                body: "<p>Plans cost $12 per seat and 40% of teams pay yearly.</p> [1]".into(),
            })
            .unwrap();
        doc
    }

    fn fix(field: &str, find: &str, replace: &str) -> RewriteFix {
        RewriteFix {
            field: field.into(),
            find: find.into(),
            replace: replace.into(),
            reason: "style".into(),
        }
    }

    #[tokio::test]
    async fn formatting_and_rewrites_are_counted() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RewritePlan {
            fixes: vec![
                fix("intro", "Let us delve into CRM software.", "Here is how CRM software works."),
                fix("section_1_body", "Plans cost $12 per seat", "Plans cost $15 per seat"),
                fix("section_1_body", "not in the text", "anything"),
                fix("footer", "x", "y"),
            ],
        });
        let adapter = adapter(client.clone());

        let (doc, report) = run_refine(document(), &options(), &adapter).await.unwrap();

        assert_eq!(doc.intro, "<p>Here is how CRM software works. It is <strong>essential</strong>.</p>");
        assert!(doc.sections.get(0).unwrap().body.contains("$12 per seat and 40% of teams pay yearly. [1]</p>"));
        assert_eq!(report.formatting_fixes, 2);
        assert_eq!(report.rewrites_suggested, 4);
        assert_eq!(report.rewrites_applied, 1);
        assert_eq!(report.rewrites_rejected, 3);
        assert_eq!(report.issues_fixed, 3);
        assert!(report.quality.banned_phrase_hits.is_empty());
        assert_eq!(report.standards_version, "v1");
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn runs_even_when_nothing_needs_fixing() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RewritePlan::default());
        let mut clean = ArticleDocument::new(JobId::new(), "crm");
        clean.intro = "<p>Clean.</p>".into();

        let (doc, report) = run_refine(clean.clone(), &options(), &adapter(client.clone()))
            .await
            .unwrap();

        assert_eq!(doc, clean);
        assert_eq!(report.issues_fixed, 0);
        assert_eq!(client.call_count(), 1);
        // targets are reported, never enforced
        assert!(!report.shortfalls.is_empty());
    }

    #[tokio::test]
    async fn permanent_rewrite_failure_fails_the_stage() {
        let client = Arc::new(ScriptedClient::new());
        client.fail::<RewritePlan>(
            None,
            CallFailure::RemoteError {
                status: Some(401),
                message: "bad key".into(),
            },
        );
        let err = run_refine(document(), &options(), &adapter(client)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentExternal);
        assert_eq!(err.stage(), Some("refine"));
    }

    #[tokio::test]
    async fn rewrites_cannot_add_links() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RewritePlan {
            fixes: vec![fix(
                "intro",
                "CRM software",
                r#"<a href="https://spam.test">CRM software</a>"#,
            )],
        });
        let (doc, report) = run_refine(document(), &options(), &adapter(client)).await.unwrap();

        assert!(!doc.intro.contains("<a "));
        assert!(doc.intro.contains("delve into CRM software."));
        assert_eq!(report.rewrites_applied, 0);
        assert_eq!(report.rewrites_rejected, 1);
    }

    #[test]
    fn number_guard_uses_multiplicity() {
        assert!(keeps_numbers("grew 18% in 2024 [1]", "rose 18% during 2024 [1]"));
        assert!(!keeps_numbers("grew 18% in 2024", "grew 20% in 2024"));
        assert!(!keeps_numbers("5 of 5 teams", "all 5 teams"));
        assert!(keeps_numbers("no numbers here", "still none"));
    }

    #[test]
    fn assessment_measures_profile_signals() {
        let quality = assess(&document(), &StandardsProfile::default());
        assert_eq!(quality.keyword_mentions, 2);
        assert_eq!(quality.statistics, 2);
        assert_eq!(quality.banned_phrase_hits, vec!["delve into".to_string()]);

        let notes = shortfalls(&quality, &StandardsProfile::default());
        assert!(notes.iter().any(|n| n.starts_with("keyword mentioned 2 times")));
        assert!(notes.iter().any(|n| n.contains("banned phrases present: delve into")));
    }
}
