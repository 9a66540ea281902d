use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use scraper::{Html, Selector};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use articleforge_shared::{ArticleForgeError, Result, VerificationConfig};

use crate::ssrf::is_ssrf_target;

/// User-Agent string for probe requests.
const USER_AGENT: &str = concat!("articleforge/", env!("CARGO_PKG_VERSION"));

/// Bodies larger than this are not parsed for title/description.
const MAX_BODY_BYTES: usize = 512 * 1024;

// ---------------------------------------------------------------------------
// Config and results
// ---------------------------------------------------------------------------

/// Network-level classification of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable { status: u16 },
    Dead { reason: String },
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl From<&VerificationConfig> for ProbeConfig {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.probe_timeout_secs),
            concurrency: config.probe_concurrency.max(1),
        }
    }
}

/// Result of probing one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub url: String,
    pub reachability: Reachability,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self.reachability, Reachability::Reachable { .. })
    }

    fn dead(url: &str, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            reachability: Reachability::Dead {
                reason: reason.into(),
            },
            title: None,
            description: None,
        }
    }

    /// Title and description as one line of relevance context.
    pub fn summary(&self) -> Option<String> {
        match (&self.title, &self.description) {
            (Some(t), Some(d)) => Some(format!("{t}: {d}")),
            (Some(t), None) => Some(t.clone()),
            (None, Some(d)) => Some(d.clone()),
            (None, None) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// Concurrent reachability checker.
#[derive(Clone)]
pub struct Prober {
    client: Client,
    concurrency: usize,
    /// Allow localhost/private IPs (for tests with mock servers).
    allow_localhost: bool,
}

impl Prober {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ArticleForgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            concurrency: config.concurrency.max(1),
            allow_localhost: false,
        })
    }

    /// Allow probing localhost/private IPs (for integration tests).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Probe one URL. Never fails; problems classify the URL as dead.
    pub async fn probe(&self, raw: &str) -> ProbeOutcome {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => return ProbeOutcome::dead(raw, format!("invalid URL: {e}")),
        };
        if !self.allow_localhost && is_ssrf_target(&url) {
            warn!(%url, "SSRF protection: blocked");
            return ProbeOutcome::dead(raw, "blocked: private or non-http target");
        }
        fetch(&self.client, raw, &url).await
    }

    /// Probe every URL with bounded concurrency. Outcomes keep input order.
    #[instrument(skip_all, fields(urls = urls.len()))]
    pub async fn probe_all(&self, urls: &[String]) -> Vec<ProbeOutcome> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (index, raw) in urls.iter().enumerate() {
            let prober = self.clone();
            let sem = semaphore.clone();
            let raw = raw.clone();
            set.spawn(async move {
                let outcome = match sem.acquire().await {
                    Ok(_permit) => prober.probe(&raw).await,
                    Err(_) => ProbeOutcome::dead(&raw, "probe cancelled"),
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<ProbeOutcome>> = vec![None; urls.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        let outcomes: Vec<ProbeOutcome> = slots
            .into_iter()
            .zip(urls)
            .map(|(slot, raw)| slot.unwrap_or_else(|| ProbeOutcome::dead(raw, "probe task failed")))
            .collect();

        info!(
            reachable = outcomes.iter().filter(|o| o.is_reachable()).count(),
            dead = outcomes.iter().filter(|o| !o.is_reachable()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "probe complete"
        );
        outcomes
    }
}

async fn fetch(client: &Client, raw: &str, url: &Url) -> ProbeOutcome {
    debug!(%url, "probing");

    let response = match client.get(url.as_str()).send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return ProbeOutcome::dead(raw, "timeout"),
        Err(e) => return ProbeOutcome::dead(raw, format!("request failed: {e}")),
    };

    let status = response.status();
    if !status.is_success() {
        return ProbeOutcome::dead(raw, format!("HTTP {status}"));
    }

    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("html"));

    let (title, description) = if is_html {
        match read_capped(response, MAX_BODY_BYTES).await {
            Ok(Some(body)) => extract_meta(&body),
            Ok(None) => (None, None),
            Err(e) if e.is_timeout() => return ProbeOutcome::dead(raw, "timeout reading body"),
            Err(_) => (None, None),
        }
    } else {
        (None, None)
    };

    ProbeOutcome {
        url: raw.to_string(),
        reachability: Reachability::Reachable {
            status: status.as_u16(),
        },
        title,
        description,
    }
}

/// `<title>` (or first `<h1>`) and meta description of a page.
/// Body text, or `None` once it exceeds `cap` bytes. Stops reading at the cap.
async fn read_capped(
    mut response: reqwest::Response,
    cap: usize,
) -> std::result::Result<Option<String>, reqwest::Error> {
    if response.content_length().is_some_and(|len| len > cap as u64) {
        return Ok(None);
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > cap {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(String::from_utf8_lossy(&body).into_owned()))
}

fn extract_meta(html: &str) -> (Option<String>, Option<String>) {
    let doc = Html::parse_document(html);
    let text_of = |sel: &str| -> Option<String> {
        let selector = Selector::parse(sel).ok()?;
        let text = doc.select(&selector).next()?.text().collect::<String>();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    };

    let title = text_of("title").or_else(|| text_of("h1"));
    let description = Selector::parse(r#"meta[name="description"], meta[property="og:description"]"#)
        .ok()
        .and_then(|sel| {
            doc.select(&sel)
                .filter_map(|el| el.value().attr("content"))
                .map(|c| c.trim().to_string())
                .find(|c| !c.is_empty())
        });
    (title, description)
}
