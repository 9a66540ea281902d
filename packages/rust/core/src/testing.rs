//! In-memory collaborators for exercising stages and the orchestrator
//! without network access.
//!
//! [`ScriptedClient`] replays queued answers per response type. An entry may
//! carry a needle: it is only served to a prompt containing that text, which
//! lets concurrent keyword runs receive different answers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use articleforge_probe::{ProbeOutcome, Reachability};
use articleforge_shared::{ArticleForgeError, Result, SitemapIndex};

use crate::llm::{
    CallFailure, CallRequest, GenerationClient, ImageRequest, RawCompletion, RawImage,
    StructuredOutput,
};
use crate::stages::context::SitemapSource;
use crate::stages::verify::ReachabilityChecker;

const IMAGE_QUEUE: &str = "__image__";

#[derive(Debug, Clone)]
enum Reply {
    Json(String),
    Image(String),
    Failure(CallFailure),
}

#[derive(Debug, Clone)]
struct Scripted {
    needle: Option<String>,
    reply: Reply,
    sticky: bool,
}

/// A [`GenerationClient`] that replays scripted answers and records calls.
#[derive(Default)]
pub struct ScriptedClient {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<CallRequest>>,
    image_prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer, e.g. to trigger the adapter timeout.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(&self, queue: String, entry: Scripted) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(queue).or_default().push_back(entry);
        }
    }

    /// Queue one answer of type `T`.
    pub fn respond<T: StructuredOutput + Serialize>(&self, value: &T) {
        self.respond_for(None, value);
    }

    /// Queue one answer of type `T`, served only to prompts containing `needle`.
    pub fn respond_for<T: StructuredOutput + Serialize>(&self, needle: Option<&str>, value: &T) {
        let json = serde_json::to_string(value).unwrap_or_default();
        self.respond_raw::<T>(needle, &json);
    }

    /// Queue a raw answer body for type `T`, valid JSON or not.
    pub fn respond_raw<T: StructuredOutput>(&self, needle: Option<&str>, raw: &str) {
        self.push(
            T::response_name(),
            Scripted {
                needle: needle.map(str::to_string),
                reply: Reply::Json(raw.to_string()),
                sticky: false,
            },
        );
    }

    /// Answer every matching call of type `T` with `value`, without depleting.
    pub fn always<T: StructuredOutput + Serialize>(&self, needle: Option<&str>, value: &T) {
        self.push(
            T::response_name(),
            Scripted {
                needle: needle.map(str::to_string),
                reply: Reply::Json(serde_json::to_string(value).unwrap_or_default()),
                sticky: true,
            },
        );
    }

    /// Queue one failure for a call of type `T`.
    pub fn fail<T: StructuredOutput>(&self, needle: Option<&str>, failure: CallFailure) {
        self.push(
            T::response_name(),
            Scripted {
                needle: needle.map(str::to_string),
                reply: Reply::Failure(failure),
                sticky: false,
            },
        );
    }

    /// Queue one generated image.
    pub fn image_ok(&self, needle: Option<&str>, url: &str) {
        self.push(
            IMAGE_QUEUE.into(),
            Scripted {
                needle: needle.map(str::to_string),
                reply: Reply::Image(url.to_string()),
                sticky: false,
            },
        );
    }

    /// Queue one failed image.
    pub fn image_fail(&self, needle: Option<&str>, failure: CallFailure) {
        self.push(
            IMAGE_QUEUE.into(),
            Scripted {
                needle: needle.map(str::to_string),
                reply: Reply::Failure(failure),
                sticky: false,
            },
        );
    }

    /// Every structured request received, in order.
    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Structured requests for response type `T`.
    pub fn calls_for<T: StructuredOutput>(&self) -> usize {
        let name = T::response_name();
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.schema_name == name).count())
            .unwrap_or_default()
    }

    pub fn image_calls(&self) -> usize {
        self.image_prompts.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn next_reply(&self, queue: &str, prompt: &str) -> Option<Reply> {
        let mut queues = self.queues.lock().ok()?;
        let entries = queues.get_mut(queue)?;
        let index = entries.iter().position(|entry| {
            entry
                .needle
                .as_deref()
                .is_none_or(|needle| prompt.contains(needle))
        })?;
        if entries[index].sticky {
            return Some(entries[index].reply.clone());
        }
        entries.remove(index).map(|entry| entry.reply)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn unscripted(what: &str) -> CallFailure {
    CallFailure::RemoteError {
        status: None,
        message: format!("no scripted answer for {what}"),
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn complete(&self, request: &CallRequest) -> std::result::Result<RawCompletion, CallFailure> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        self.pause().await;

        match self.next_reply(&request.schema_name, &request.prompt) {
            Some(Reply::Json(content)) => Ok(RawCompletion {
                content,
                tokens_in: request.prompt.len() as u64 / 4,
                tokens_out: 50,
            }),
            Some(Reply::Failure(failure)) => Err(failure),
            Some(Reply::Image(_)) | None => Err(unscripted(&request.schema_name)),
        }
    }

    async fn generate_image(&self, request: &ImageRequest) -> std::result::Result<RawImage, CallFailure> {
        if let Ok(mut prompts) = self.image_prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        self.pause().await;

        match self.next_reply(IMAGE_QUEUE, &request.prompt) {
            Some(Reply::Image(url)) => Ok(RawImage { url }),
            Some(Reply::Failure(failure)) => Err(failure),
            Some(Reply::Json(_)) | None => Err(unscripted("image")),
        }
    }
}

// ---------------------------------------------------------------------------
// Sitemaps and reachability
// ---------------------------------------------------------------------------

/// A sitemap source returning a fixed index, or failing.
pub struct StaticSitemap(pub Option<SitemapIndex>);

#[async_trait]
impl SitemapSource for StaticSitemap {
    async fn fetch(&self, company_url: &str) -> Result<SitemapIndex> {
        self.0
            .clone()
            .ok_or_else(|| ArticleForgeError::Network(format!("{company_url}: sitemap unavailable")))
    }
}

/// Every URL is reachable except the listed dead ones.
#[derive(Default)]
pub struct StaticReachability {
    pub dead: HashSet<String>,
    pub titles: HashMap<String, String>,
    checked: Mutex<Vec<String>>,
}

impl StaticReachability {
    pub fn with_dead<I, S>(dead: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dead: dead.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Every URL checked so far, in order.
    pub fn checked(&self) -> Vec<String> {
        self.checked.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReachabilityChecker for StaticReachability {
    async fn check(&self, urls: &[String]) -> Vec<ProbeOutcome> {
        if let Ok(mut checked) = self.checked.lock() {
            checked.extend(urls.iter().cloned());
        }
        urls.iter()
            .map(|url| {
                let reachability = if self.dead.contains(url) {
                    Reachability::Dead {
                        reason: "HTTP 404 Not Found".into(),
                    }
                } else {
                    Reachability::Reachable { status: 200 }
                };
                ProbeOutcome {
                    url: url.clone(),
                    reachability,
                    title: self.titles.get(url).cloned(),
                    description: None,
                }
            })
            .collect()
    }
}
