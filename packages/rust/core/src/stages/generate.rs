//! Stage 2: article generation.
//!
//! One grounded structured call writes the whole article. Unless images are
//! skipped, the hero/mid/bottom images are then generated concurrently; each
//! image fails on its own without failing the stage.

use futures::future::join3;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use articleforge_shared::document::{
    MAX_FAQS, MAX_PAA, MAX_SECTIONS, MAX_SOURCES, MAX_TABLES, MAX_TAKEAWAYS,
};
use articleforge_shared::{
    ArticleDocument, ComparisonTable, DocumentMeta, ErrorKind, GenerationReport, Image,
    ImageOutcome, ImageResult, ImageSlot, JobRecord, QaPair, Result, RetryConfig, Section,
    SharedContext, Slots, Source, StageName, StandardsProfile,
};

use crate::llm::{CallAdapter, CallResponse};
use crate::prompts;
use crate::retry::with_retry;

/// The structured answer of the generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedArticle {
    pub headline: String,
    pub subtitle: String,
    pub teaser: String,
    pub direct_answer: String,
    /// HTML paragraphs.
    pub intro: String,
    pub sections: Slots<Section, MAX_SECTIONS>,
    pub key_takeaways: Slots<String, MAX_TAKEAWAYS>,
    pub faqs: Slots<QaPair, MAX_FAQS>,
    pub paa: Slots<QaPair, MAX_PAA>,
    pub tables: Slots<ComparisonTable, MAX_TABLES>,
    pub sources: Slots<Source, MAX_SOURCES>,
    pub search_queries: String,
}

impl CallResponse for GeneratedArticle {
    fn has_content(&self) -> bool {
        !self.headline.trim().is_empty() && !self.sections.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub skip_images: bool,
    pub retry: RetryConfig,
    pub standards: StandardsProfile,
}

/// Write the article for `job`.
///
/// Fails when the generation call fails; image failures only show up in the
/// report.
#[instrument(skip_all, fields(keyword = %job.keyword, job_id = %job.job_id))]
pub async fn run_generate(
    job: &JobRecord,
    context: &SharedContext,
    options: &GenerateOptions,
    adapter: &CallAdapter,
) -> Result<(ArticleDocument, GenerationReport)> {
    let prompt = prompts::article(job, context, &options.standards);
    let article = with_retry(&options.retry, StageName::Generate, |attempt| {
        adapter.invoke::<GeneratedArticle>(&prompt, true, attempt.strict)
    })
    .await?;

    let mut document = into_document(job, article);
    let mut report = GenerationReport {
        sections: document.sections.len(),
        faqs: document.faqs.len(),
        paa: document.paa.len(),
        tables: document.tables.len(),
        sources: document.sources.len(),
        ..Default::default()
    };

    if !options.skip_images {
        let [hero, mid, bottom] = ImageSlot::ALL.map(|slot| image_subject(&document, slot));
        let company = &context.company;
        let (hero, mid, bottom) = join3(
            generate_image(ImageSlot::Hero, hero, &document.keyword, company, options, adapter),
            generate_image(ImageSlot::Mid, mid, &document.keyword, company, options, adapter),
            generate_image(ImageSlot::Bottom, bottom, &document.keyword, company, options, adapter),
        )
        .await;

        for outcome in [hero, mid, bottom] {
            report.images_attempted += 1;
            if let ImageResult::Generated { url, alt } = &outcome.result {
                report.images_generated += 1;
                document.images.set(
                    outcome.slot,
                    Image {
                        url: url.clone(),
                        alt: alt.clone(),
                    },
                );
            }
            report.images.push(outcome);
        }
    }

    info!(
        sections = report.sections,
        sources = report.sources,
        images_generated = report.images_generated,
        "article generated"
    );
    Ok((document, report))
}

fn into_document(job: &JobRecord, article: GeneratedArticle) -> ArticleDocument {
    ArticleDocument {
        headline: article.headline.trim().to_string(),
        subtitle: article.subtitle,
        teaser: article.teaser,
        direct_answer: article.direct_answer,
        intro: article.intro,
        sections: article.sections,
        key_takeaways: article.key_takeaways,
        faqs: article.faqs,
        paa: article.paa,
        tables: article.tables,
        sources: article.sources,
        search_queries: article.search_queries,
        meta: DocumentMeta {
            language: job.language.clone(),
            market: job.market.clone(),
            target_word_count: job.word_count,
            ..Default::default()
        },
        ..ArticleDocument::new(job.job_id, job.keyword.clone())
    }
}

/// What an image slot depicts; also its alt text.
fn image_subject(document: &ArticleDocument, slot: ImageSlot) -> String {
    let section_title = |index: usize| {
        document
            .sections
            .get(index)
            .map(|s| s.title.trim())
            .filter(|t| !t.is_empty())
    };
    let subject = match slot {
        ImageSlot::Hero => None,
        ImageSlot::Mid => section_title(document.sections.len() / 2),
        ImageSlot::Bottom => document.sections.len().checked_sub(1).and_then(section_title),
    };
    subject.unwrap_or(&document.headline).to_string()
}

async fn generate_image(
    slot: ImageSlot,
    subject: String,
    keyword: &str,
    company: &articleforge_shared::CompanyContext,
    options: &GenerateOptions,
    adapter: &CallAdapter,
) -> ImageOutcome {
    let prompt = prompts::image(slot, keyword, &subject, company);
    let result = match with_retry(&options.retry, StageName::Generate, |_| adapter.image(&prompt)).await {
        Ok(image) => ImageResult::Generated {
            url: image.url,
            alt: subject,
        },
        Err(e) => {
            warn!(%slot, error = %e, "image generation failed, leaving slot empty");
            ImageResult::Failed {
                kind: ErrorKind::PartialDegradation,
                message: e.to_string(),
            }
        }
    };
    ImageOutcome { slot, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AdapterConfig, CallFailure};
    use crate::testing::ScriptedClient;
    use articleforge_shared::JobId;
    use std::sync::Arc;
    use std::time::Duration;

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

    fn options(skip_images: bool) -> GenerateOptions {
        GenerateOptions {
            skip_images,
            retry: RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                ..RetryConfig::default()
            },
            standards: StandardsProfile::default(),
        }
    }

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

    fn article() -> GeneratedArticle {
        GeneratedArticle {
            headline: "Choosing CRM Software".into(),
            intro: "<p>Most teams outgrow spreadsheets [1].</p>".into(),
            sections: Slots::from_vec(vec![
                Section {
                    title: "Pricing".into(),
                    body: "<p>Plans start at $12 per seat [1].</p>".into(),
                },
                Section {
                    title: "Integrations".into(),
                    body: "<p>Email sync is standard [2].</p>".into(),
                },
                Section {
                    title: "Rollout".into(),
                    body: "<p>Start with one team.</p>".into(),
                },
            ])
            .unwrap(),
            sources: Slots::from_vec(vec![
                Source {
                    title: "Pricing study".into(),
                    url: "https://research.test/pricing".into(),
                },
                Source {
                    title: "Sync guide".into(),
                    url: "https://docs.test/sync".into(),
                },
            ])
            .unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_failed_image_degrades_without_failing() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&article());
        client.image_ok(Some("wide hero"), "https://img.test/hero.png");
        client.image_fail(
            Some("explanatory"),
            CallFailure::RemoteError {
                status: Some(500),
                message: "model overloaded".into(),
            },
        );
        client.image_ok(Some("closing image"), "https://img.test/bottom.png");
        let adapter = adapter(client.clone());

        let (document, report) = run_generate(&job(), &SharedContext::default(), &options(false), &adapter)
            .await
            .unwrap();

        assert_eq!(document.images.filled(), 2);
        assert!(document.images.mid.is_none());
        assert_eq!(report.images_attempted, 3);
        assert_eq!(report.images_generated, 2);
        assert_eq!(document.images.bottom.as_ref().unwrap().alt, "Rollout");
        // generation + two successful images
        assert_eq!(adapter.tally().succeeded, 3);
        assert_eq!(document.meta.target_word_count, 1500);
        assert_eq!(document.keyword, "crm software");
    }

    #[tokio::test]
    async fn skip_images_makes_one_call() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&article());
        let adapter = adapter(client.clone());

        let (document, report) = run_generate(&job(), &SharedContext::default(), &options(true), &adapter)
            .await
            .unwrap();

        assert_eq!(client.image_calls(), 0);
        assert_eq!(adapter.tally().succeeded, 1);
        assert_eq!(report.images_attempted, 0);
        assert_eq!(document.images.filled(), 0);
        assert_eq!(report.sections, 3);
    }

    #[tokio::test]
    async fn over_bound_answer_is_reprompted_strictly() {
        let client = Arc::new(ScriptedClient::new());
        let sections: Vec<Section> = (0..10)
            .map(|i| Section {
                title: format!("S{i}"),
                body: "<p>x</p>".into(),
            })
            .collect();
        let oversized = serde_json::json!({
            "headline": "Too long", "subtitle": "", "teaser": "", "direct_answer": "",
            "intro": "", "sections": sections, "key_takeaways": [], "faqs": [], "paa": [],
            "tables": [], "sources": [], "search_queries": ""
        });
        client.respond_raw::<GeneratedArticle>(None, &oversized.to_string());
        client.respond(&article());

        let (document, _) = run_generate(&job(), &SharedContext::default(), &options(true), &adapter(client.clone()))
            .await
            .unwrap();

        assert_eq!(document.sections.len(), 3);
        assert_eq!(client.call_count(), 2);
        assert!(client.calls()[1].prompt.contains("IMPORTANT"));
    }

    #[tokio::test]
    async fn generation_failure_fails_the_stage() {
        let client = Arc::new(ScriptedClient::new());
        for _ in 0..3 {
            client.fail::<GeneratedArticle>(None, CallFailure::Timeout);
        }

        let err = run_generate(&job(), &SharedContext::default(), &options(false), &adapter(client.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermanentExternal);
        assert_eq!(err.stage(), Some("generate"));
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.image_calls(), 0);
    }

    #[test]
    fn schema_bounds_reach_the_provider() {
        use crate::llm::StructuredOutput;
        let schema = GeneratedArticle::strict_schema();
        assert_eq!(schema["properties"]["sections"]["maxItems"], 9);
        assert_eq!(schema["properties"]["faqs"]["maxItems"], 6);
        assert_eq!(schema["properties"]["paa"]["maxItems"], 4);
        assert_eq!(schema["additionalProperties"], false);
    }
}
