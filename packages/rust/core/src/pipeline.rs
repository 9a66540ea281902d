//! End-to-end `run` pipeline: batch → context → per-keyword stages → merged articles.
//!
//! Stage 1 runs once per batch. Every keyword then runs
//! generate → refine → verify → link → merge on its own [`CallAdapter`], with
//! bounded concurrency across keywords. A failing keyword ends with a
//! [`FailureReport`]; the others carry on.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use articleforge_shared::{
    AppConfig, ArticleDocument, ArticleForgeError, BatchId, BatchInput, CallTally, ContextOutput,
    FailureReport, JobRecord, MergedArticle, Result, SharedContext, SitemapIndex, StageEntry,
    StageName, StageRecord, StageReport,
};
use articleforge_storage::Storage;

use crate::guard::FieldGuard;
use crate::llm::{AdapterConfig, CallAdapter, GenerationClient};
use crate::merge::assemble;
use crate::stages::context::{ContextOptions, SitemapSource, run_context};
use crate::stages::generate::{GenerateOptions, run_generate};
use crate::stages::link::{LinkOptions, LinkTargets, run_link};
use crate::stages::refine::{RefineOptions, run_refine};
use crate::stages::verify::{ReachabilityChecker, VerifyOptions, run_verify};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a batch-level phase.
    fn phase(&self, name: &str);
    /// Called when a keyword starts its stage sequence.
    fn job_started(&self, keyword: &str, index: usize, total: usize);
    /// Called when a keyword enters a stage.
    fn stage_started(&self, keyword: &str, stage: StageName);
    /// Called when a keyword completes or fails.
    fn job_finished(&self, outcome: &JobOutcome);
    /// Called when the batch completes.
    fn done(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn job_started(&self, _keyword: &str, _index: usize, _total: usize) {}
    fn stage_started(&self, _keyword: &str, _stage: StageName) {}
    fn job_finished(&self, _outcome: &JobOutcome) {}
    fn done(&self, _report: &BatchReport) {}
}

// ---------------------------------------------------------------------------
// Options and collaborators
// ---------------------------------------------------------------------------

/// Options for every per-keyword stage.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub generate: GenerateOptions,
    pub refine: RefineOptions,
    pub verify: VerifyOptions,
    pub link: LinkOptions,
}

impl StageOptions {
    /// Options for a job in `market`, using that market's standards profile.
    pub fn from_config(config: &AppConfig, market: &str, skip_images: bool) -> Self {
        let standards = config.standards_for(market).clone();
        Self {
            generate: GenerateOptions {
                skip_images,
                retry: config.retry.clone(),
                standards: standards.clone(),
            },
            refine: RefineOptions {
                retry: config.retry.clone(),
                standards,
            },
            verify: VerifyOptions::new(&config.verification, &config.retry),
            link: LinkOptions::new(&config.linking, &config.retry),
        }
    }
}

/// Batch-level switches from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub skip_images: bool,
    pub legal_research: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            skip_images: false,
            legal_research: true,
        }
    }
}

/// External collaborators of a run.
#[derive(Clone)]
pub struct PipelineDeps {
    pub client: Arc<dyn GenerationClient>,
    pub adapter: AdapterConfig,
    pub sitemap: Arc<dyn SitemapSource>,
    pub checker: Arc<dyn ReachabilityChecker>,
    pub cache: Option<Arc<Storage>>,
}

impl PipelineDeps {
    /// A fresh adapter, so each keyword gets its own call tally.
    pub fn new_adapter(&self) -> CallAdapter {
        let adapter = CallAdapter::new(self.client.clone(), self.adapter.clone());
        match &self.cache {
            Some(cache) => adapter.with_cache(cache.clone()),
            None => adapter,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(Box<MergedArticle>),
    Failed(FailureReport),
}

impl JobOutcome {
    pub fn keyword(&self) -> &str {
        match self {
            Self::Completed(article) => &article.document.keyword,
            Self::Failed(failure) => &failure.keyword,
        }
    }

    pub fn calls(&self) -> CallTally {
        match self {
            Self::Completed(article) => article.calls,
            Self::Failed(failure) => failure.calls,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Option<BatchId>,
    pub completed: usize,
    pub failed: usize,
    /// Stage 1 output, absent when it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextOutput>,
    pub outcomes: Vec<JobOutcome>,
    /// Stage 1 failure; no keyword ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FailureReport>,
}

impl BatchReport {
    /// 0 when every keyword completed, 2 on partial success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() || self.completed == 0 {
            1
        } else if self.failed > 0 {
            2
        } else {
            0
        }
    }

    /// Calls across Stage 1 and every keyword.
    pub fn total_calls(&self) -> CallTally {
        let mut total = self.context.as_ref().map(|c| c.calls).unwrap_or_default();
        if let Some(fatal) = &self.fatal {
            total.add(&fatal.calls);
        }
        for outcome in &self.outcomes {
            total.add(&outcome.calls());
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Run the whole pipeline for a batch.
#[instrument(skip_all, fields(keywords = input.keywords.len(), company = %input.company_url))]
pub async fn run_batch(
    input: &BatchInput,
    config: &AppConfig,
    deps: &PipelineDeps,
    run: &RunOptions,
    progress: &dyn ProgressReporter,
) -> BatchReport {
    let start = Instant::now();

    progress.phase("Building shared context");
    let context_adapter = deps.new_adapter();
    let context_options = ContextOptions {
        legal_research: run.legal_research,
        ..ContextOptions::new(&config.defaults, &config.retry)
    };
    let output = match run_context(input, &context_options, &context_adapter, deps.sitemap.as_ref()).await {
        Ok(output) => Arc::new(output),
        Err(e) => {
            error!(error = %e, "context stage failed, aborting batch");
            let report = BatchReport {
                batch_id: None,
                completed: 0,
                failed: 0,
                context: None,
                outcomes: Vec::new(),
                fatal: Some(FailureReport {
                    keyword: String::new(),
                    job_id: None,
                    stage: e.stage().unwrap_or(StageName::Context.as_str()).to_string(),
                    kind: e.kind(),
                    message: e.to_string(),
                    calls: context_adapter.tally(),
                }),
            };
            progress.done(&report);
            return report;
        }
    };

    let total = output.jobs.len();
    let concurrency = config.defaults.concurrency.max(1);
    progress.phase("Writing articles");
    info!(batch_id = %output.batch_id, jobs = total, concurrency, "starting keyword runs");

    let outcomes: Vec<JobOutcome> = stream::iter(output.jobs.iter().cloned().enumerate())
        .map(|(index, job)| {
            let output = output.clone();
            async move {
                progress.job_started(&job.keyword, index, total);
                let options = StageOptions::from_config(config, &job.market, run.skip_images);
                let outcome = run_job(job, &output, &options, deps, progress).await;
                progress.job_finished(&outcome);
                outcome
            }
        })
        .buffered(concurrency)
        .collect()
        .await;

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, JobOutcome::Completed(_)))
        .count();
    let report = BatchReport {
        batch_id: Some(output.batch_id),
        completed,
        failed: outcomes.len() - completed,
        context: Some(output.as_ref().clone()),
        outcomes,
        fatal: None,
    };
    info!(
        completed = report.completed,
        failed = report.failed,
        calls = report.total_calls().network_calls(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "batch complete"
    );
    progress.done(&report);
    report
}

/// One keyword's stage sequence. Never fails: errors become a [`FailureReport`].
#[instrument(skip_all, fields(keyword = %job.keyword, job_id = %job.job_id))]
pub async fn run_job(
    job: JobRecord,
    output: &ContextOutput,
    options: &StageOptions,
    deps: &PipelineDeps,
    progress: &dyn ProgressReporter,
) -> JobOutcome {
    let adapter = deps.new_adapter();
    let keyword = job.keyword.clone();
    let job_id = job.job_id;

    match run_sequence(job, output, options, deps, &adapter, progress).await {
        Ok(article) => JobOutcome::Completed(Box::new(article)),
        Err((stage, e)) => {
            warn!(%stage, kind = e.kind().as_str(), error = %e, "keyword failed");
            JobOutcome::Failed(FailureReport {
                keyword,
                job_id: Some(job_id),
                stage: e.stage().unwrap_or(stage.as_str()).to_string(),
                kind: e.kind(),
                message: e.to_string(),
                calls: adapter.tally(),
            })
        }
    }
}

async fn run_sequence(
    job: JobRecord,
    output: &ContextOutput,
    options: &StageOptions,
    deps: &PipelineDeps,
    adapter: &CallAdapter,
    progress: &dyn ProgressReporter,
) -> std::result::Result<MergedArticle, (StageName, ArticleForgeError)> {
    let keyword = job.keyword.clone();
    let at = |stage: StageName| move |e: ArticleForgeError| (stage, e);

    progress.stage_started(&keyword, StageName::Generate);
    let record = generate_step(job, &output.context, &options.generate, adapter)
        .await
        .map_err(at(StageName::Generate))?;

    progress.stage_started(&keyword, StageName::Refine);
    let record = refine_step(record, &options.refine, adapter)
        .await
        .map_err(at(StageName::Refine))?;

    progress.stage_started(&keyword, StageName::Verify);
    let record = verify_step(record, &options.verify, adapter, deps.checker.as_ref())
        .await
        .map_err(at(StageName::Verify))?;

    progress.stage_started(&keyword, StageName::Link);
    let record = link_step(record, &output.jobs, &output.context.sitemap, &options.link, adapter)
        .await
        .map_err(at(StageName::Link))?;

    progress.stage_started(&keyword, StageName::Merge);
    merge_step(record).map_err(at(StageName::Merge))
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Guard, tally snapshot and clock around one stage.
struct StageSpan {
    stage: StageName,
    guard: FieldGuard,
    before: CallTally,
    started: Instant,
}

impl StageSpan {
    fn start(stage: StageName, document: &ArticleDocument, adapter: &CallAdapter) -> Self {
        Self {
            stage,
            guard: FieldGuard::capture(stage, document),
            before: adapter.tally(),
            started: Instant::now(),
        }
    }

    fn finish(
        self,
        record: &mut StageRecord,
        document: ArticleDocument,
        report: StageReport,
        adapter: &CallAdapter,
    ) -> Result<()> {
        self.guard.check(&document)?;
        record.document = document;
        record.record(StageEntry {
            stage: self.stage,
            calls: adapter.tally().since(&self.before),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            report,
        });
        Ok(())
    }
}

/// Stage 2 for one job; starts the job's record.
pub async fn generate_step(
    job: JobRecord,
    context: &SharedContext,
    options: &GenerateOptions,
    adapter: &CallAdapter,
) -> Result<StageRecord> {
    let empty = ArticleDocument::new(job.job_id, job.keyword.clone());
    let span = StageSpan::start(StageName::Generate, &empty, adapter);
    let (document, report) = run_generate(&job, context, options, adapter).await?;
    let mut record = StageRecord::new(job, empty);
    span.finish(&mut record, document, StageReport::Generate(report), adapter)?;
    Ok(record)
}

pub async fn refine_step(
    mut record: StageRecord,
    options: &RefineOptions,
    adapter: &CallAdapter,
) -> Result<StageRecord> {
    record.ensure_after(StageName::Generate)?;
    let span = StageSpan::start(StageName::Refine, &record.document, adapter);
    let (document, report) = run_refine(std::mem::take(&mut record.document), options, adapter).await?;
    span.finish(&mut record, document, StageReport::Refine(report), adapter)?;
    Ok(record)
}

pub async fn verify_step(
    mut record: StageRecord,
    options: &VerifyOptions,
    adapter: &CallAdapter,
    checker: &dyn ReachabilityChecker,
) -> Result<StageRecord> {
    record.ensure_after(StageName::Refine)?;
    let span = StageSpan::start(StageName::Verify, &record.document, adapter);
    let (document, report) =
        run_verify(std::mem::take(&mut record.document), options, adapter, checker).await?;
    span.finish(&mut record, document, StageReport::Verify(report), adapter)?;
    Ok(record)
}

/// Stage 5; `siblings` is every job of the batch, the record's own included.
pub async fn link_step(
    mut record: StageRecord,
    siblings: &[JobRecord],
    sitemap: &SitemapIndex,
    options: &LinkOptions,
    adapter: &CallAdapter,
) -> Result<StageRecord> {
    record.ensure_after(StageName::Verify)?;
    let span = StageSpan::start(StageName::Link, &record.document, adapter);
    let own_path = record.job.path.clone();
    let targets = LinkTargets {
        own_path: &own_path,
        siblings,
        sitemap,
    };
    let (document, report) =
        run_link(std::mem::take(&mut record.document), targets, options, adapter).await?;
    span.finish(&mut record, document, StageReport::Link(report), adapter)?;
    Ok(record)
}

pub fn merge_step(record: StageRecord) -> Result<MergedArticle> {
    let guard = FieldGuard::capture(StageName::Merge, &record.document);
    let (merged, _) = assemble(record)?;
    guard.check(&merged.document)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CallFailure;
    use crate::stages::generate::GeneratedArticle;
    use crate::stages::link::{LinkPlan, LinkSuggestion};
    use crate::stages::refine::RewritePlan;
    use crate::stages::verify::{RelevanceVerdicts, ReplacementSearch};
    use crate::testing::{ScriptedClient, StaticReachability, StaticSitemap};
    use articleforge_shared::{
        CompanyContext, ErrorKind, JobId, KeywordSpec, RetryConfig, Section, Slots, Source,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry = RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryConfig::default()
        };
        config.defaults.concurrency = 2;
        config
    }

    fn input(keywords: &[&str], company: Option<CompanyContext>) -> BatchInput {
        BatchInput {
            keywords: keywords.iter().map(|k| KeywordSpec::Plain(k.to_string())).collect(),
            company_url: "https://acme.test".into(),
            language: None,
            market: None,
            word_count: None,
            instructions: None,
            company_context: company,
        }
    }

    fn company() -> CompanyContext {
        CompanyContext {
            name: "Acme".into(),
            industry: "CRM".into(),
            description: "Acme builds CRM software for small teams.".into(),
            ..Default::default()
        }
    }

    fn article(topic: &str) -> GeneratedArticle {
        GeneratedArticle {
            headline: format!("A Guide to {topic}"),
            intro: format!("<p>Why {topic} matters for sales teams [1].</p>"),
            sections: Slots::from_vec(vec![
                Section {
                    title: "Basics".into(),
                    body: format!("<p>Start with a clear {topic} process [2].</p>"),
                },
                Section {
                    title: "Tools".into(),
                    body: "<p>Pick tools your team already uses.</p>".into(),
                },
            ])
            .unwrap(),
            sources: Slots::from_vec(vec![
                Source {
                    title: "Study".into(),
                    url: "https://research.test/study".into(),
                },
                Source {
                    title: "Guide".into(),
                    url: "https://docs.test/guide".into(),
                },
            ])
            .unwrap(),
            ..Default::default()
        }
    }

    fn deps(client: Arc<ScriptedClient>, checker: Arc<StaticReachability>) -> PipelineDeps {
        PipelineDeps {
            client,
            adapter: AdapterConfig {
                model: "test/model".into(),
                image_model: "test/image".into(),
                timeout: Duration::from_secs(1),
                search_results: 3,
            },
            sitemap: Arc::new(StaticSitemap(Some(SitemapIndex::default()))),
            checker,
            cache: None,
        }
    }

    fn script_common(client: &ScriptedClient) {
        client.always(None, &RewritePlan::default());
        client.always(None, &RelevanceVerdicts::default());
        client.always(None, &LinkPlan::default());
    }

    fn skip_images() -> RunOptions {
        RunOptions {
            skip_images: true,
            ..RunOptions::default()
        }
    }

    #[tokio::test]
    async fn one_failed_keyword_is_a_partial_success() {
        let client = Arc::new(ScriptedClient::new());
        client.respond_for(Some("PRIMARY KEYWORD: crm software"), &article("crm software"));
        for _ in 0..3 {
            client.fail::<GeneratedArticle>(Some("PRIMARY KEYWORD: lead scoring"), CallFailure::Timeout);
        }
        script_common(&client);
        let deps = deps(client.clone(), Arc::new(StaticReachability::default()));

        let report = run_batch(
            &input(&["crm software", "lead scoring"], Some(company())),
            &config(),
            &deps,
            &skip_images(),
            &SilentProgress,
        )
        .await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.exit_code(), 2);

        let JobOutcome::Completed(done) = &report.outcomes[0] else {
            panic!("first keyword should complete");
        };
        assert_eq!(done.slug, "crm-software");
        let stages: Vec<StageName> = done.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![
                StageName::Generate,
                StageName::Refine,
                StageName::Verify,
                StageName::Link,
                StageName::Merge
            ]
        );
        // generate + rewrite + relevance + link
        assert_eq!(done.calls.succeeded, 4);
        assert!(done.document.intro.contains("class=\"citation\""));
        assert_eq!(done.toc.len(), 2);

        let JobOutcome::Failed(failure) = &report.outcomes[1] else {
            panic!("second keyword should fail");
        };
        assert_eq!(failure.keyword, "lead scoring");
        assert_eq!(failure.stage, "generate");
        assert_eq!(failure.kind, ErrorKind::PermanentExternal);
        assert_eq!(failure.calls.failed_after_network, 3);
        assert_eq!(client.calls_for::<RewritePlan>(), 1);
    }

    #[tokio::test]
    async fn context_failure_aborts_the_batch() {
        let client = Arc::new(ScriptedClient::new());
        client.fail::<CompanyContext>(
            None,
            CallFailure::RemoteError {
                status: Some(401),
                message: "invalid key".into(),
            },
        );
        let deps = deps(client.clone(), Arc::new(StaticReachability::default()));

        let report = run_batch(&input(&["crm software"], None), &config(), &deps, &skip_images(), &SilentProgress).await;

        assert_eq!(report.exit_code(), 1);
        let fatal = report.fatal.as_ref().unwrap();
        assert_eq!(fatal.stage, "context");
        assert_eq!(fatal.kind, ErrorKind::PermanentExternal);
        assert!(report.outcomes.is_empty());
        assert_eq!(client.calls_for::<GeneratedArticle>(), 0);
    }

    #[tokio::test]
    async fn dead_sources_and_sibling_links_flow_through() {
        let client = Arc::new(ScriptedClient::new());
        client.respond_for(Some("PRIMARY KEYWORD: crm software"), &article("crm software"));
        client.respond_for(Some("PRIMARY KEYWORD: lead scoring"), &article("lead scoring"));
        client.always(None, &RewritePlan::default());
        client.always(None, &RelevanceVerdicts::default());
        client.always(None, &ReplacementSearch::default());
        client.always(
            Some("ARTICLE TOPIC: crm software"),
            &LinkPlan {
                links: vec![LinkSuggestion {
                    field: "section_2_body".into(),
                    find: "tools".into(),
                    replace: "<a href=\"/blog/lead-scoring\">tools</a>".into(),
                    url: "/blog/lead-scoring".into(),
                }],
            },
        );
        client.always(None, &LinkPlan::default());
        let checker = Arc::new(StaticReachability::with_dead(["https://docs.test/guide"]));
        let deps = deps(client.clone(), checker);

        let report = run_batch(
            &input(&["crm software", "lead scoring"], Some(company())),
            &config(),
            &deps,
            &skip_images(),
            &SilentProgress,
        )
        .await;

        assert_eq!(report.exit_code(), 0);
        for outcome in &report.outcomes {
            let JobOutcome::Completed(done) = outcome else {
                panic!("{} failed", outcome.keyword());
            };
            assert_eq!(done.document.sources.len(), 1);
            assert!(!done.document.sections.get(0).unwrap().body.contains("[2]"));
        }
        let JobOutcome::Completed(crm) = &report.outcomes[0] else {
            unreachable!()
        };
        assert!(crm.document.sections.get(1).unwrap().body.contains("href=\"/blog/lead-scoring\""));
        assert!(report.context.is_some());
    }

    #[tokio::test]
    async fn steps_reject_records_out_of_order() {
        let client = Arc::new(ScriptedClient::new());
        let adapter = deps(client.clone(), Arc::new(StaticReachability::default())).new_adapter();
        let job = JobRecord {
            job_id: JobId::new(),
            keyword: "crm".into(),
            slug: "crm".into(),
            path: "/blog/crm".into(),
            word_count: 1500,
            instructions: String::new(),
            language: "en".into(),
            market: "US".into(),
        };
        let fresh = StageRecord::new(job.clone(), ArticleDocument::new(job.job_id, "crm"));
        let options = StageOptions::from_config(&config(), "US", true);

        let err = refine_step(fresh, &options.refine, &adapter).await.unwrap_err();
        assert!(err.to_string().contains("generate"));
        assert_eq!(client.call_count(), 0);
    }

    /// Records progress callbacks.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ProgressReporter for Recorder {
        fn phase(&self, name: &str) {
            self.0.lock().unwrap().push(format!("phase:{name}"));
        }
        fn job_started(&self, keyword: &str, _index: usize, _total: usize) {
            self.0.lock().unwrap().push(format!("start:{keyword}"));
        }
        fn stage_started(&self, _keyword: &str, _stage: StageName) {}
        fn job_finished(&self, outcome: &JobOutcome) {
            self.0.lock().unwrap().push(format!("finish:{}", outcome.keyword()));
        }
        fn done(&self, report: &BatchReport) {
            self.0.lock().unwrap().push(format!("done:{}", report.exit_code()));
        }
    }

    #[tokio::test]
    async fn progress_sees_every_job() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&article("crm software"));
        script_common(&client);
        let recorder = Recorder::default();

        let report = run_batch(
            &input(&["crm software"], Some(company())),
            &config(),
            &deps(client, Arc::new(StaticReachability::default())),
            &skip_images(),
            &recorder,
        )
        .await;

        assert_eq!(report.exit_code(), 0);
        let events = recorder.0.lock().unwrap().clone();
        assert!(events.contains(&"start:crm software".to_string()));
        assert!(events.contains(&"finish:crm software".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("done:0"));
    }
}
