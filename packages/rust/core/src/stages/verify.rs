//! Stage 4: source URL verification.
//!
//! Phase one checks reachability over plain HTTP and costs no external
//! calls. Phase two makes at most two batched calls whatever the number of
//! sources: one relevance verdict over every reachable URL, and one grounded
//! search for replacements of every dead or irrelevant URL.
//!
//! A source that cannot be replaced is removed together with every marker
//! citing it; the remaining markers are renumbered so they stay dense.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use articleforge_markup::citations::{marker_numbers, remove_marker, renumber};
use articleforge_probe::{ProbeOutcome, Prober, Reachability};
use articleforge_shared::{
    ArticleDocument, Replacement, Result, RetryConfig, Slots, Source, StageName,
    VerificationConfig, VerificationResult, VerificationStatus, VerifyReport,
};

use crate::llm::{CallAdapter, CallFailure, CallResponse};
use crate::prompts::{self, RelevanceItem, ReplacementItem};
use crate::retry::{call_with_retry, with_retry};

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

/// Network reachability for a batch of URLs; outcomes keep input order.
#[async_trait]
pub trait ReachabilityChecker: Send + Sync {
    async fn check(&self, urls: &[String]) -> Vec<ProbeOutcome>;
}

#[async_trait]
impl ReachabilityChecker for Prober {
    async fn check(&self, urls: &[String]) -> Vec<ProbeOutcome> {
        self.probe_all(urls).await
    }
}

// ---------------------------------------------------------------------------
// Call shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RelevanceVerdicts {
    pub verdicts: Vec<RelevanceVerdict>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RelevanceVerdict {
    /// Source number as listed in the prompt.
    pub number: u32,
    pub relevant: bool,
    /// One sentence on what the page covers.
    pub summary: String,
}

/// Sources without a verdict count as relevant.
impl CallResponse for RelevanceVerdicts {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReplacementSearch {
    pub replacements: Vec<ProposedReplacement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProposedReplacement {
    pub original_url: String,
    pub url: String,
    pub source_name: String,
    pub anchor_text: String,
    pub reason: String,
}

impl CallResponse for ReplacementSearch {
    fn has_content(&self) -> bool {
        !self.replacements.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Sources past this position are left unverified.
    pub max_urls: usize,
    pub retry: RetryConfig,
}

impl VerifyOptions {
    pub fn new(config: &VerificationConfig, retry: &RetryConfig) -> Self {
        Self {
            max_urls: config.max_urls,
            retry: retry.clone(),
        }
    }
}

/// Classification of one checked source before replacement.
#[derive(Debug, Clone)]
struct Checked {
    status: VerificationStatus,
    summary: Option<String>,
    problem: String,
}

impl Checked {
    fn dead(problem: &str) -> Self {
        Self {
            status: VerificationStatus::Dead,
            summary: None,
            problem: problem.to_string(),
        }
    }
}

#[instrument(skip_all, fields(keyword = %document.keyword, job_id = %document.job_id, sources = document.sources.len()))]
pub async fn run_verify(
    mut document: ArticleDocument,
    options: &VerifyOptions,
    adapter: &CallAdapter,
    checker: &dyn ReachabilityChecker,
) -> Result<(ArticleDocument, VerifyReport)> {
    let total = document.sources.len();
    let limit = total.min(options.max_urls);
    let mut report = VerifyReport {
        checked: limit,
        unverified: total - limit,
        ..Default::default()
    };

    let urls: Vec<String> = document.sources.iter().take(limit).map(|s| s.url.clone()).collect();
    let outcomes = checker.check(&urls).await;
    let mut checked = classify_reachability(&urls, &outcomes);

    let reachable: Vec<usize> = (0..limit)
        .filter(|&i| checked[i].status == VerificationStatus::Valid)
        .collect();
    if !reachable.is_empty() {
        let items: Vec<RelevanceItem<'_>> = reachable
            .iter()
            .map(|&i| RelevanceItem {
                number: i + 1,
                url: &document.sources.as_slice()[i].url,
                title: &document.sources.as_slice()[i].title,
                page_summary: checked[i].summary.clone(),
            })
            .collect();
        let prompt = prompts::relevance(&document.keyword, &document.headline, &items);
        let verdicts = with_retry(&options.retry, StageName::Verify, |attempt| {
            adapter.invoke::<RelevanceVerdicts>(&prompt, false, attempt.strict)
        })
        .await?;
        apply_verdicts(&mut checked, &verdicts);
    }

    let bad: Vec<usize> = (0..limit)
        .filter(|&i| checked[i].status != VerificationStatus::Valid)
        .collect();
    let replacements = if bad.is_empty() {
        HashMap::new()
    } else {
        let proposals = search_replacements(&document, &checked, &bad, options, adapter).await;
        accept_replacements(&document, &bad, proposals, checker).await
    };

    // Rebuild the sources list and the old -> new marker mapping.
    let mut kept = Vec::with_capacity(total);
    let mut mapping = BTreeMap::new();
    let mut removed_numbers = Vec::new();
    for (index, source) in document.sources.iter().enumerate() {
        let number = index + 1;
        if index >= limit {
            kept.push(source.clone());
            mapping.insert(number, kept.len());
            continue;
        }

        let entry = &checked[index];
        match entry.status {
            VerificationStatus::Dead => report.dead += 1,
            VerificationStatus::Irrelevant => report.irrelevant += 1,
            _ => report.valid += 1,
        }
        let mut result = VerificationResult {
            url: source.url.clone(),
            status: entry.status,
            summary: entry.summary.clone(),
            replacement: None,
            removed: false,
        };

        if entry.status == VerificationStatus::Valid {
            kept.push(source.clone());
            mapping.insert(number, kept.len());
        } else if let Some(replacement) = replacements.get(&index) {
            kept.push(Source {
                title: replacement_title(replacement),
                url: replacement.url.clone(),
            });
            mapping.insert(number, kept.len());
            result.status = VerificationStatus::Replaced;
            result.replacement = Some(replacement.clone());
            report.replaced += 1;
        } else {
            removed_numbers.push(number);
            result.removed = true;
            report.removed += 1;
        }
        report.results.push(result);
    }

    let markers_removed = rewrite_markers(&mut document, total, &removed_numbers, &mapping);
    document.sources = Slots::from_vec(kept)?;

    info!(
        checked = report.checked,
        valid = report.valid,
        replaced = report.replaced,
        removed = report.removed,
        markers_removed,
        "sources verified"
    );
    Ok((document, report))
}

/// One entry per URL; a URL the checker returned no outcome for counts as dead.
fn classify_reachability(urls: &[String], outcomes: &[ProbeOutcome]) -> Vec<Checked> {
    let mut results = outcomes.iter();
    urls.iter()
        .map(|url| match results.next() {
            Some(outcome) if outcome.url != *url => {
                warn!(%url, got = %outcome.url, "probe outcome out of order");
                Checked::dead("no probe result")
            }
            Some(outcome) => match &outcome.reachability {
                Reachability::Reachable { .. } => Checked {
                    status: VerificationStatus::Valid,
                    summary: outcome.summary(),
                    problem: String::new(),
                },
                Reachability::Dead { reason } => Checked::dead(&format!("unreachable: {reason}")),
            },
            None => Checked::dead("no probe result"),
        })
        .collect()
}

fn apply_verdicts(checked: &mut [Checked], verdicts: &RelevanceVerdicts) {
    for verdict in &verdicts.verdicts {
        let Some(entry) = (verdict.number as usize)
            .checked_sub(1)
            .and_then(|i| checked.get_mut(i))
        else {
            debug!(number = verdict.number, "verdict for unknown source ignored");
            continue;
        };
        if entry.status != VerificationStatus::Valid {
            continue;
        }
        if !verdict.summary.trim().is_empty() {
            entry.summary = Some(verdict.summary.trim().to_string());
        }
        if !verdict.relevant {
            entry.status = VerificationStatus::Irrelevant;
            entry.problem = "off-topic for this article".into();
        }
    }
}

/// One grounded call for every bad source. Failures degrade to "no replacements".
async fn search_replacements(
    document: &ArticleDocument,
    checked: &[Checked],
    bad: &[usize],
    options: &VerifyOptions,
    adapter: &CallAdapter,
) -> Vec<ProposedReplacement> {
    let sources = document.sources.as_slice();
    let items: Vec<ReplacementItem<'_>> = bad
        .iter()
        .map(|&i| ReplacementItem {
            url: &sources[i].url,
            title: &sources[i].title,
            problem: &checked[i].problem,
        })
        .collect();
    let prompt = prompts::replacement(document, &items);

    match call_with_retry(&options.retry, StageName::Verify, |attempt| {
        adapter.invoke::<ReplacementSearch>(&prompt, true, attempt.strict)
    })
    .await
    {
        Ok(search) => search.replacements,
        Err(CallFailure::EmptyResult(_)) => {
            debug!("replacement search found nothing");
            Vec::new()
        }
        Err(failure) => {
            warn!(error = %failure, "replacement search failed, dropping unreplaced sources");
            Vec::new()
        }
    }
}

/// Probe proposals and keep the first reachable, unique one per bad source.
async fn accept_replacements(
    document: &ArticleDocument,
    bad: &[usize],
    proposals: Vec<ProposedReplacement>,
    checker: &dyn ReachabilityChecker,
) -> HashMap<usize, Replacement> {
    let sources = document.sources.as_slice();
    let mut by_url: HashMap<&str, Vec<usize>> = HashMap::new();
    for &i in bad {
        by_url.entry(sources[i].url.as_str()).or_default().push(i);
    }
    let mut taken: HashSet<String> = sources.iter().map(|s| s.url.clone()).collect();

    let mut candidates: Vec<(usize, ProposedReplacement)> = Vec::new();
    for proposal in proposals {
        let url = proposal.url.trim();
        let Some(indices) = by_url.get(proposal.original_url.trim()) else {
            debug!(original = %proposal.original_url, "replacement for unknown source ignored");
            continue;
        };
        if url.is_empty() || !taken.insert(url.to_string()) {
            debug!(%url, "duplicate replacement rejected");
            continue;
        }
        let proposal = ProposedReplacement {
            url: url.to_string(),
            ..proposal
        };
        candidates.extend(indices.iter().map(|&index| (index, proposal.clone())));
    }
    if candidates.is_empty() {
        return HashMap::new();
    }

    let urls: Vec<String> = candidates.iter().map(|(_, p)| p.url.clone()).collect();
    let outcomes = checker.check(&urls).await;
    let mut accepted = HashMap::new();
    for ((index, proposal), outcome) in candidates.into_iter().zip(outcomes) {
        if !outcome.is_reachable() {
            debug!(url = %proposal.url, "unreachable replacement rejected");
            continue;
        }
        accepted.entry(index).or_insert(Replacement {
            url: proposal.url,
            source_name: proposal.source_name,
            anchor_text: proposal.anchor_text,
            reason: proposal.reason,
        });
    }
    accepted
}

fn replacement_title(replacement: &Replacement) -> String {
    [&replacement.source_name, &replacement.anchor_text, &replacement.url]
        .into_iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Drop markers of removed sources and markers past the list, then renumber.
/// Returns the number of markers removed.
fn rewrite_markers(
    document: &mut ArticleDocument,
    total: usize,
    removed: &[usize],
    mapping: &BTreeMap<usize, usize>,
) -> usize {
    let mut count = 0;
    for field in document.cited_fields() {
        let Some(text) = document.text_mut(field) else {
            continue;
        };
        let mut html = std::mem::take(text);
        let dangling = marker_numbers(&html)
            .into_iter()
            .filter(|&n| n == 0 || n > total);
        for n in removed.iter().copied().chain(dangling) {
            let (next, hits) = remove_marker(&html, n);
            html = next;
            count += hits;
        }
        *text = renumber(&html, mapping);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::AdapterConfig;
    use crate::testing::{ScriptedClient, StaticReachability};
    use articleforge_shared::{JobId, Section};
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

    fn options(max_urls: usize) -> VerifyOptions {
        VerifyOptions {
            max_urls,
            retry: RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                ..RetryConfig::default()
            },
        }
    }

    fn source(n: usize) -> Source {
        Source {
            title: format!("Source {n}"),
            url: format!("https://src{n}.test/page"),
        }
    }

    fn document(sources: usize) -> ArticleDocument {
        let mut doc = ArticleDocument::new(JobId::new(), "crm software");
        doc.headline = "Choosing CRM Software".into();
        doc.intro = "<p>Adoption grew [1] and churn fell [2].</p>".into();
        doc.sections
            .try_push(Section {
                title: "Pricing".into(),
                body: "<p>Seats cost $12 [3]. Most pay yearly [1].</p>".into(),
            })
            .unwrap();
        doc.sources = Slots::from_vec((1..=sources).map(source).collect()).unwrap();
        doc
    }

    fn verdict(number: u32, relevant: bool) -> RelevanceVerdict {
        RelevanceVerdict {
            number,
            relevant,
            summary: format!("page {number}"),
        }
    }

    #[tokio::test]
    async fn all_valid_sources_cost_one_call() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts {
            verdicts: vec![verdict(1, true), verdict(2, true), verdict(3, true)],
        });
        let checker = StaticReachability::default();

        let (doc, report) = run_verify(document(3), &options(20), &adapter(client.clone()), &checker)
            .await
            .unwrap();

        assert_eq!(report.valid, 3);
        assert_eq!(report.removed, 0);
        assert_eq!(doc.sources.len(), 3);
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.calls_for::<ReplacementSearch>(), 0);
        assert_eq!(report.results[0].summary.as_deref(), Some("page 1"));
    }

    #[tokio::test]
    async fn dead_source_replaced_and_irrelevant_removed() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts {
            verdicts: vec![verdict(2, false), verdict(3, true)],
        });
        client.respond(&ReplacementSearch {
            replacements: vec![
                ProposedReplacement {
                    original_url: source(1).url,
                    url: "https://fresh.test/adoption".into(),
                    source_name: "Fresh Research".into(),
                    anchor_text: "adoption study".into(),
                    reason: "current figures".into(),
                },
                ProposedReplacement {
                    original_url: source(2).url,
                    url: "https://gone.test/churn".into(),
                    source_name: "Gone".into(),
                    anchor_text: "churn".into(),
                    reason: "closest match".into(),
                },
            ],
        });
        let checker = StaticReachability::with_dead([source(1).url, "https://gone.test/churn".into()]);

        let (doc, report) = run_verify(document(3), &options(20), &adapter(client.clone()), &checker)
            .await
            .unwrap();

        assert_eq!(client.call_count(), 2);
        assert_eq!(report.dead, 1);
        assert_eq!(report.irrelevant, 1);
        assert_eq!(report.replaced, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(
            doc.sources.as_slice(),
            &[
                Source {
                    title: "Fresh Research".into(),
                    url: "https://fresh.test/adoption".into()
                },
                source(3)
            ]
        );
        // [2] dropped, [3] renumbered to [2]
        assert_eq!(doc.intro, "<p>Adoption grew [1] and churn fell.</p>");
        assert_eq!(doc.sections.get(0).unwrap().body, "<p>Seats cost $12 [2]. Most pay yearly [1].</p>");
        assert_eq!(report.results[0].status, VerificationStatus::Replaced);
        assert!(report.results[1].removed);
    }

    #[tokio::test]
    async fn empty_replacement_search_removes_dead_sources() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts::default());
        client.respond(&ReplacementSearch::default());
        let checker = StaticReachability::with_dead([source(3).url]);

        let (doc, report) = run_verify(document(3), &options(20), &adapter(client.clone()), &checker)
            .await
            .unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(doc.sources.len(), 2);
        assert_eq!(doc.sections.get(0).unwrap().body, "<p>Seats cost $12. Most pay yearly [1].</p>");
        // empty answer is not retried
        assert_eq!(client.calls_for::<ReplacementSearch>(), 1);
    }

    #[tokio::test]
    async fn failed_replacement_search_degrades() {
        let client = Arc::new(ScriptedClient::new());
        client.fail::<ReplacementSearch>(
            None,
            CallFailure::RemoteError {
                status: Some(403),
                message: "forbidden".into(),
            },
        );
        let checker = StaticReachability::with_dead([source(1).url, source(2).url, source(3).url]);

        let (doc, report) = run_verify(document(3), &options(20), &adapter(client.clone()), &checker)
            .await
            .unwrap();

        // nothing reachable: no relevance call
        assert_eq!(client.calls_for::<RelevanceVerdicts>(), 0);
        assert_eq!(report.removed, 3);
        assert!(doc.sources.is_empty());
        assert_eq!(doc.intro, "<p>Adoption grew and churn fell.</p>");
    }

    #[tokio::test]
    async fn many_sources_still_batch_into_two_calls() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts::default());
        client.respond(&ReplacementSearch::default());
        let dead: Vec<String> = (1..=12).filter(|n| n % 2 == 0).map(|n| source(n).url).collect();
        let checker = StaticReachability::with_dead(dead);

        let (doc, report) = run_verify(document(12), &options(20), &adapter(client.clone()), &checker)
            .await
            .unwrap();

        assert_eq!(client.call_count(), 2);
        assert_eq!(report.removed, 6);
        assert_eq!(doc.sources.len(), 6);
        for field in doc.cited_fields() {
            let text = doc.text(field).unwrap_or_default();
            assert!(marker_numbers(text).iter().all(|&n| n >= 1 && n <= doc.sources.len()));
        }
    }

    #[tokio::test]
    async fn sources_past_the_bound_are_left_unverified() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts::default());
        let checker = StaticReachability::default();

        let (doc, report) = run_verify(document(3), &options(2), &adapter(client), &checker)
            .await
            .unwrap();

        assert_eq!(checker.checked().len(), 2);
        assert_eq!(report.checked, 2);
        assert_eq!(report.unverified, 1);
        assert_eq!(doc.sources.len(), 3);
    }

    #[tokio::test]
    async fn dangling_markers_are_dropped_and_no_sources_means_no_calls() {
        let client = Arc::new(ScriptedClient::new());
        let mut doc = document(0);
        doc.direct_answer = "CRM tools centralise contacts [4].".into();

        let (doc, report) = run_verify(doc, &options(20), &adapter(client.clone()), &StaticReachability::default())
            .await
            .unwrap();

        assert_eq!(client.call_count(), 0);
        assert_eq!(report.checked, 0);
        assert_eq!(doc.direct_answer, "CRM tools centralise contacts.");
        assert_eq!(doc.intro, "<p>Adoption grew and churn fell.</p>");
    }

    /// Answers for the first `limit` URLs only.
    struct TruncatingChecker {
        limit: usize,
    }

    #[async_trait]
    impl ReachabilityChecker for TruncatingChecker {
        async fn check(&self, urls: &[String]) -> Vec<ProbeOutcome> {
            StaticReachability::default()
                .check(&urls[..urls.len().min(self.limit)])
                .await
        }
    }

    #[tokio::test]
    async fn missing_probe_results_count_as_dead() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts {
            verdicts: vec![verdict(1, true)],
        });
        client.respond(&ReplacementSearch::default());
        let checker = TruncatingChecker { limit: 1 };

        let (doc, report) = run_verify(document(3), &options(20), &adapter(client.clone()), &checker)
            .await
            .unwrap();

        assert_eq!(report.valid, 1);
        assert_eq!(report.dead, 2);
        assert_eq!(doc.sources.as_slice(), &[source(1)]);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_source_urls_share_a_replacement() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&RelevanceVerdicts {
            verdicts: vec![verdict(1, true)],
        });
        client.respond(&ReplacementSearch {
            replacements: vec![ProposedReplacement {
                original_url: source(2).url,
                url: "https://fresh.test/churn".into(),
                source_name: "Churn Study".into(),
                anchor_text: "churn".into(),
                reason: "live copy".into(),
            }],
        });
        let mut doc = document(3);
        doc.sources = Slots::from_vec(vec![source(1), source(2), source(2)]).unwrap();
        let checker = StaticReachability::with_dead([source(2).url]);

        let (doc, report) = run_verify(doc, &options(20), &adapter(client), &checker)
            .await
            .unwrap();

        assert_eq!(report.replaced, 2);
        assert_eq!(report.removed, 0);
        assert!(doc.sources.iter().skip(1).all(|s| s.url == "https://fresh.test/churn"));
    }
}
