//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use articleforge_core::llm::{AdapterConfig, OpenRouterClient};
use articleforge_core::merge::{read_input, write_output};
use articleforge_core::pipeline::{
    BatchReport, JobOutcome, PipelineDeps, ProgressReporter, RunOptions, StageOptions,
    generate_step, link_step, merge_step, refine_step, run_batch, verify_step,
};
use articleforge_core::refresh::{RefreshOptions, refresh};
use articleforge_core::stages::context::{ContextOptions, DiscoverySitemap, run_context};
use articleforge_discovery::DiscoveryOptions;
use articleforge_probe::{ProbeConfig, Prober};
use articleforge_shared::{
    AppConfig, BatchInput, ContextOutput, MergedArticle, RefreshReport, StageName, StageRecord,
    database_path, init_config, load_config, validate_api_key,
};
use articleforge_storage::{RunRecord, RunStatus, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// articleforge: keyword batches in, publication-ready articles out.
#[derive(Parser)]
#[command(
    name = "articleforge",
    version,
    about = "Generate researched, cited and internally linked articles from keyword batches.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Stage 1: build the shared context and job list for a batch.
    Context {
        /// Batch input JSON.
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Record that legal research was not requested.
        #[arg(long)]
        no_legal_research: bool,
    },

    /// Stage 2: write one job's article.
    Generate {
        /// Context JSON from `articleforge context`.
        #[arg(long)]
        context: PathBuf,
        /// Job index (0-based) or keyword.
        #[arg(long)]
        job: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        skip_images: bool,
    },

    /// Stage 3: formatting and quality refinement.
    Refine {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Stage 4: verify, replace or remove cited sources.
    Verify {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Stage 5: embed internal links.
    Link {
        #[arg(long)]
        input: PathBuf,
        /// Context JSON providing sibling jobs and sitemap URLs.
        #[arg(long)]
        context: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Resolve citations and assemble the final article.
    Merge {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Update outdated statements in a merged article.
    Refresh {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Skip the refresh call and pass the article through.
        #[arg(long)]
        disable: bool,
    },

    /// Run the whole pipeline for a batch.
    Run {
        #[arg(long)]
        input: PathBuf,
        /// Output directory (defaults to `[defaults].output_dir`).
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        skip_images: bool,
        #[arg(long)]
        no_legal_research: bool,
    },

    /// List recent keyword runs.
    History {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "articleforge=info",
        1 => "articleforge=debug",
        _ => "articleforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command; returns the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Context {
            input,
            output,
            no_legal_research,
        } => cmd_context(&input, &output, !no_legal_research).await,
        Command::Generate {
            context,
            job,
            output,
            skip_images,
        } => cmd_generate(&context, &job, &output, skip_images).await,
        Command::Refine { input, output } => cmd_refine(&input, &output).await,
        Command::Verify { input, output } => cmd_verify(&input, &output).await,
        Command::Link {
            input,
            context,
            output,
        } => cmd_link(&input, &context, &output).await,
        Command::Merge { input, output } => cmd_merge(&input, &output),
        Command::Refresh {
            input,
            output,
            disable,
        } => cmd_refresh(&input, &output, disable).await,
        Command::Run {
            input,
            out_dir,
            skip_images,
            no_legal_research,
        } => {
            let options = RunOptions {
                skip_images,
                legal_research: !no_legal_research,
            };
            cmd_run(&input, out_dir, &options).await
        }
        Command::History { limit } => cmd_history(limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Loaded config plus the production collaborators.
struct Runtime {
    config: AppConfig,
    deps: PipelineDeps,
}

async fn runtime() -> Result<Runtime> {
    let config = load_config()?;
    config.validate()?;
    let api_key = validate_api_key(&config)?;

    let client = OpenRouterClient::new(&config.openrouter, api_key)?;
    let prober = Prober::new(ProbeConfig::from(&config.verification))?;
    let cache = if config.cache.enabled {
        match Storage::open(&database_path(&config)?).await {
            Ok(storage) => Some(Arc::new(storage)),
            Err(e) => {
                warn!(error = %e, "call cache unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let deps = PipelineDeps {
        client: Arc::new(client),
        adapter: AdapterConfig::from(&config.openrouter),
        sitemap: Arc::new(DiscoverySitemap {
            options: DiscoveryOptions::default(),
        }),
        checker: Arc::new(prober),
        cache,
    };
    Ok(Runtime { config, deps })
}

fn read_record(path: &Path) -> Result<StageRecord> {
    let record: StageRecord = read_input(path)?;
    Ok(record)
}

fn read_context(path: &Path) -> Result<ContextOutput> {
    let context: ContextOutput = read_input(path)?;
    context.check_version()?;
    Ok(context)
}

fn print_written(what: &str, path: &Path) {
    println!("  {what} written to {}", path.display());
}

// ---------------------------------------------------------------------------
// Single-stage commands
// ---------------------------------------------------------------------------

async fn cmd_context(input: &Path, output: &Path, legal_research: bool) -> Result<i32> {
    let rt = runtime().await?;
    let batch: BatchInput = read_input(input)?;
    let options = ContextOptions {
        legal_research,
        ..ContextOptions::new(&rt.config.defaults, &rt.config.retry)
    };
    let adapter = rt.deps.new_adapter();

    let context = run_context(&batch, &options, &adapter, rt.deps.sitemap.as_ref()).await?;
    write_output(output, &context)?;

    info!(jobs = context.jobs.len(), calls = context.calls.network_calls(), "context built");
    if let Some(reason) = &context.report.sitemap_degraded {
        println!("  Sitemap unavailable: {reason}");
    }
    println!("  Jobs: {}", context.jobs.len());
    print_written("Context", output);
    Ok(0)
}

async fn cmd_generate(context: &Path, selector: &str, output: &Path, skip_images: bool) -> Result<i32> {
    let rt = runtime().await?;
    let context = read_context(context)?;
    let job = context
        .find_job(selector)
        .cloned()
        .ok_or_else(|| eyre!("no job '{selector}' in context (use a 0-based index or the exact keyword)"))?;
    let options = StageOptions::from_config(&rt.config, &job.market, skip_images);
    let adapter = rt.deps.new_adapter();

    let record = generate_step(job, &context.context, &options.generate, &adapter).await?;
    write_output(output, &record)?;
    print_stage_summary(&record);
    print_written("Record", output);
    Ok(0)
}

async fn cmd_refine(input: &Path, output: &Path) -> Result<i32> {
    let rt = runtime().await?;
    let record = read_record(input)?;
    let options = StageOptions::from_config(&rt.config, &record.job.market, true);
    let adapter = rt.deps.new_adapter();

    let record = refine_step(record, &options.refine, &adapter).await?;
    write_output(output, &record)?;
    print_stage_summary(&record);
    print_written("Record", output);
    Ok(0)
}

async fn cmd_verify(input: &Path, output: &Path) -> Result<i32> {
    let rt = runtime().await?;
    let record = read_record(input)?;
    let options = StageOptions::from_config(&rt.config, &record.job.market, true);
    let adapter = rt.deps.new_adapter();

    let record = verify_step(record, &options.verify, &adapter, rt.deps.checker.as_ref()).await?;
    write_output(output, &record)?;
    print_stage_summary(&record);
    print_written("Record", output);
    Ok(0)
}

async fn cmd_link(input: &Path, context: &Path, output: &Path) -> Result<i32> {
    let rt = runtime().await?;
    let record = read_record(input)?;
    let context = read_context(context)?;
    let options = StageOptions::from_config(&rt.config, &record.job.market, true);
    let adapter = rt.deps.new_adapter();

    let record = link_step(
        record,
        &context.jobs,
        &context.context.sitemap,
        &options.link,
        &adapter,
    )
    .await?;
    write_output(output, &record)?;
    print_stage_summary(&record);
    print_written("Record", output);
    Ok(0)
}

fn cmd_merge(input: &Path, output: &Path) -> Result<i32> {
    let record = read_record(input)?;
    let merged = merge_step(record)?;
    write_output(output, &merged)?;

    println!("  Headline: {}", merged.document.headline);
    println!(
        "  Words:    {} (~{} min)",
        merged.document.meta.word_count, merged.document.meta.reading_time_minutes
    );
    println!("  Sources:  {}", merged.document.sources.len());
    print_written("Article", output);
    Ok(0)
}

async fn cmd_refresh(input: &Path, output: &Path, disable: bool) -> Result<i32> {
    let config = load_config()?;
    let article: MergedArticle = read_input(input)?;
    let mut options = RefreshOptions::new(&config.freshness, &config.retry);
    options.enabled &= !disable;

    let (article, report) = if options.enabled {
        let rt = runtime().await?;
        let adapter = rt.deps.new_adapter();
        refresh(article, &options, &adapter).await?
    } else {
        // Disabled refresh makes no call, so no API key is needed.
        article.check_version()?;
        (article, RefreshReport::default())
    };
    write_output(output, &article)?;

    if report.enabled {
        println!("  Updates suggested: {}", report.suggested);
        println!("  Updates applied:   {}", report.applied.len());
        for update in &report.applied {
            println!("    {}: {} ({})", update.field, update.reason, update.source_url);
        }
    } else {
        println!("  Refresh disabled; article passed through unchanged.");
    }
    print_written("Article", output);
    Ok(0)
}

fn print_stage_summary(record: &StageRecord) {
    if let Some(entry) = record.history.last() {
        println!(
            "  {} stage for '{}': {} calls, {} ms",
            entry.stage,
            record.job.keyword,
            entry.calls.network_calls(),
            entry.elapsed_ms
        );
    }
}

// ---------------------------------------------------------------------------
// Full run
// ---------------------------------------------------------------------------

async fn cmd_run(input: &Path, out_dir: Option<PathBuf>, options: &RunOptions) -> Result<i32> {
    let rt = runtime().await?;
    let batch: BatchInput = read_input(input)?;
    let out_dir = out_dir.unwrap_or_else(|| PathBuf::from(&rt.config.defaults.output_dir));

    info!(keywords = batch.keywords.len(), out = %out_dir.display(), "starting batch");
    let reporter = CliProgress::new();
    let report = run_batch(&batch, &rt.config, &rt.deps, options, &reporter).await;

    let written = write_run_outputs(&report, &out_dir)?;
    record_history(&rt.config, &report, &written).await;
    print_run_summary(&report, &out_dir);
    Ok(report.exit_code())
}

/// Write `context.json`, one `<slug>.json` per article and `failures.json`.
/// Returns the article path per outcome (None for failures).
fn write_run_outputs(report: &BatchReport, out_dir: &Path) -> Result<Vec<Option<PathBuf>>> {
    if let Some(context) = &report.context {
        write_output(&out_dir.join("context.json"), context)?;
    }

    let mut failures = Vec::new();
    let mut written = Vec::with_capacity(report.outcomes.len());
    for outcome in &report.outcomes {
        match outcome {
            JobOutcome::Completed(article) => {
                let path = out_dir.join(format!("{}.json", article.slug));
                write_output(&path, article.as_ref())?;
                written.push(Some(path));
            }
            JobOutcome::Failed(failure) => {
                failures.push(failure.clone());
                written.push(None);
            }
        }
    }
    if let Some(fatal) = &report.fatal {
        failures.push(fatal.clone());
    }
    if !failures.is_empty() {
        write_output(&out_dir.join("failures.json"), &failures)?;
    }
    Ok(written)
}

/// Append every outcome to run history. History is best-effort.
async fn record_history(config: &AppConfig, report: &BatchReport, written: &[Option<PathBuf>]) {
    let storage = match database_path(config) {
        Ok(path) => Storage::open(&path).await,
        Err(e) => Err(e),
    };
    let storage = match storage {
        Ok(storage) => storage,
        Err(e) => {
            warn!(error = %e, "run history unavailable");
            return;
        }
    };

    let batch_id = report
        .batch_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".into());
    let mut records: Vec<RunRecord> = report
        .outcomes
        .iter()
        .zip(written)
        .map(|(outcome, path)| match outcome {
            JobOutcome::Completed(article) => RunRecord::completed(
                batch_id.clone(),
                article.document.job_id.to_string(),
                article.document.keyword.clone(),
                article.calls,
                path.as_ref().map(|p| p.display().to_string()),
            ),
            JobOutcome::Failed(failure) => RunRecord::failed(
                batch_id.clone(),
                failure.job_id.map(|id| id.to_string()),
                failure.keyword.clone(),
                failure.stage.clone(),
                failure.kind.as_str(),
                failure.message.clone(),
                failure.calls,
            ),
        })
        .collect();
    if let Some(fatal) = &report.fatal {
        records.push(RunRecord::failed(
            batch_id.clone(),
            None,
            "(batch)",
            fatal.stage.clone(),
            fatal.kind.as_str(),
            fatal.message.clone(),
            fatal.calls,
        ));
    }

    for record in &records {
        if let Err(e) = storage.insert_run(record).await {
            warn!(error = %e, keyword = %record.keyword, "failed to record run");
        }
    }
}

fn print_run_summary(report: &BatchReport, out_dir: &Path) {
    let calls = report.total_calls();
    println!();
    if let Some(fatal) = &report.fatal {
        println!("  Batch failed in {} stage: {}", fatal.stage, fatal.message);
    } else {
        println!("  Batch complete!");
        if let Some(id) = report.batch_id {
            println!("  Batch:     {id}");
        }
        println!("  Completed: {}", report.completed);
        println!("  Failed:    {}", report.failed);
        for outcome in &report.outcomes {
            if let JobOutcome::Failed(failure) = outcome {
                println!(
                    "    {} ({} / {}): {}",
                    failure.keyword,
                    failure.stage,
                    failure.kind.as_str(),
                    failure.message
                );
            }
        }
    }
    println!(
        "  Calls:     {} ({} cached, {} tokens in, {} tokens out)",
        calls.network_calls(),
        calls.cache_hits,
        calls.tokens_in,
        calls.tokens_out
    );
    println!("  Output:    {}", out_dir.display());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    total: AtomicUsize,
    finished: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            total: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    fn counter(&self) -> String {
        format!(
            "[{}/{}]",
            self.finished.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed)
        )
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn job_started(&self, keyword: &str, _index: usize, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.spinner.set_message(format!("{} {keyword}: starting", self.counter()));
    }

    fn stage_started(&self, keyword: &str, stage: StageName) {
        self.spinner.set_message(format!("{} {keyword}: {stage}", self.counter()));
    }

    fn job_finished(&self, outcome: &JobOutcome) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        let status = match outcome {
            JobOutcome::Completed(_) => "done".to_string(),
            JobOutcome::Failed(failure) => format!("failed in {}", failure.stage),
        };
        self.spinner.println(format!("  {} {}", outcome.keyword(), status));
    }

    fn done(&self, _report: &BatchReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// History and config
// ---------------------------------------------------------------------------

async fn cmd_history(limit: u32) -> Result<i32> {
    let config = load_config()?;
    let path = database_path(&config)?;
    if !path.exists() {
        println!("No runs recorded yet.");
        return Ok(0);
    }
    let storage = Storage::open_readonly(&path).await?;
    let runs = storage.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(0);
    }

    for run in runs {
        let detail = match run.status {
            RunStatus::Completed => run.output_path.unwrap_or_default(),
            RunStatus::Failed => format!(
                "{} / {}: {}",
                run.failed_stage.unwrap_or_default(),
                run.error_kind.unwrap_or_default(),
                run.message.unwrap_or_default()
            ),
        };
        println!(
            "{}  {:<9}  {:<32}  {:>3} calls  {}",
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.status.as_str(),
            run.keyword,
            run.calls.network_calls(),
            detail
        );
    }
    Ok(0)
}

fn cmd_config_init() -> Result<i32> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(0)
}

fn cmd_config_show() -> Result<i32> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(0)
}
