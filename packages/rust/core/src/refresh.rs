//! Standalone freshness refresh over a merged article.
//!
//! One grounded call looks for outdated statements relative to today's date
//! and returns cited find/replace updates. Updates whose text is no longer
//! present are skipped, so running the refresh twice changes nothing the
//! second time.

use std::time::Instant;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use articleforge_markup::{adds_anchor, replace_once_outside_anchors};
use articleforge_shared::{
    AppliedUpdate, FreshnessConfig, MergedArticle, RefreshReport, Result, RetryConfig, StageEntry,
    StageName, StageReport, TextField,
};

use crate::guard::FieldGuard;
use crate::llm::{CallAdapter, CallFailure, CallResponse};
use crate::merge::derive_metrics;
use crate::prompts;
use crate::retry::{call_with_retry, promote};
use crate::toc::build_toc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FreshnessPlan {
    pub updates: Vec<FreshnessUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FreshnessUpdate {
    pub field: String,
    pub find: String,
    pub replace: String,
    pub reason: String,
    /// Page that proves the newer information.
    pub source_url: String,
}

impl CallResponse for FreshnessPlan {
    fn has_content(&self) -> bool {
        !self.updates.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub enabled: bool,
    /// ISO date the prompt treats as today.
    pub today: String,
    pub retry: RetryConfig,
}

impl RefreshOptions {
    pub fn new(config: &FreshnessConfig, retry: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            today: Utc::now().date_naive().to_string(),
            retry: retry.clone(),
        }
    }
}

#[instrument(skip_all, fields(keyword = %article.document.keyword, enabled = options.enabled))]
pub async fn refresh(
    mut article: MergedArticle,
    options: &RefreshOptions,
    adapter: &CallAdapter,
) -> Result<(MergedArticle, RefreshReport)> {
    article.check_version()?;
    let mut report = RefreshReport {
        enabled: options.enabled,
        ..Default::default()
    };
    if !options.enabled {
        debug!("freshness refresh disabled");
        return Ok((article, report));
    }

    let started = Instant::now();
    let tally = adapter.tally();
    let guard = FieldGuard::capture(StageName::Refresh, &article.document);

    let prompt = prompts::freshness(&article.document, &options.today);
    let updates = match call_with_retry(&options.retry, StageName::Refresh, |attempt| {
        adapter.invoke::<FreshnessPlan>(&prompt, true, attempt.strict)
    })
    .await
    {
        Ok(plan) => plan.updates,
        Err(CallFailure::EmptyResult(_)) => Vec::new(),
        Err(failure) => return Err(promote(failure, StageName::Refresh)),
    };

    report.suggested = updates.len();
    for update in updates {
        match apply_update(&mut article, &update) {
            Ok(()) => report.applied.push(AppliedUpdate {
                field: update.field,
                find: update.find,
                replace: update.replace,
                reason: update.reason,
                source_url: update.source_url,
            }),
            Err(reason) => {
                debug!(field = %update.field, reason, "update skipped");
                report.skipped += 1;
            }
        }
    }

    if !report.applied.is_empty() {
        derive_metrics(&mut article.document);
        article.toc = build_toc(article.document.sections.as_slice());
    }
    guard.check(&article.document)?;

    let calls = adapter.tally().since(&tally);
    article.calls.add(&calls);
    article.stages.push(StageEntry {
        stage: StageName::Refresh,
        calls,
        elapsed_ms: started.elapsed().as_millis() as u64,
        report: StageReport::Refresh(report.clone()),
    });
    info!(
        suggested = report.suggested,
        applied = report.applied.len(),
        skipped = report.skipped,
        "freshness refresh complete"
    );
    Ok((article, report))
}

fn apply_update(
    article: &mut MergedArticle,
    update: &FreshnessUpdate,
) -> std::result::Result<(), &'static str> {
    let field = TextField::parse(&update.field).ok_or("unknown field")?;
    if update.find.trim().is_empty() || update.find == update.replace {
        return Err("empty or no-op update");
    }
    if update.source_url.trim().is_empty() {
        return Err("update cites no source");
    }
    if adds_anchor(&update.find, &update.replace) {
        return Err("update adds link markup");
    }
    let text = article.document.text_mut(field).ok_or("inactive field")?;
    *text = replace_once_outside_anchors(text, &update.find, &update.replace)
        .ok_or("find text not present")?;
    Ok(())
}
