//! The per-run call adapter.
//!
//! Every external call of a keyword run goes through one [`CallAdapter`]: it
//! rejects empty prompts before the network, applies the per-call timeout,
//! parses the structured answer and tallies the outcome. An optional
//! append-only cache short-circuits repeated prompts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use articleforge_shared::{CallTally, OpenRouterConfig};
use articleforge_storage::Storage;

use super::{
    CallFailure, CallRequest, CallResponse, GenerationClient, Grounding, ImageRequest, RawImage,
};

/// Appended to the prompt on the re-prompt after a malformed response.
const STRICT_SUFFIX: &str = "\n\nIMPORTANT: Your previous answer did not match the required JSON schema. \
Respond with a single JSON object that satisfies the schema exactly: every required field present, \
no extra fields, no prose, no markdown fences, and never more array items than the schema allows.";

/// Per-adapter call settings.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub model: String,
    pub image_model: String,
    pub timeout: Duration,
    pub search_results: u32,
}

impl From<&OpenRouterConfig> for AdapterConfig {
    fn from(config: &OpenRouterConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            image_model: config.image_model.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            search_results: config.search_results.max(1),
        }
    }
}

/// Typed, counted, time-bounded access to a [`GenerationClient`].
///
/// One adapter per keyword run: its tally is that run's call accounting.
pub struct CallAdapter {
    client: Arc<dyn GenerationClient>,
    config: AdapterConfig,
    cache: Option<Arc<Storage>>,
    tally: Mutex<CallTally>,
}

impl CallAdapter {
    pub fn new(client: Arc<dyn GenerationClient>, config: AdapterConfig) -> Self {
        Self {
            client,
            config,
            cache: None,
            tally: Mutex::new(CallTally::default()),
        }
    }

    /// Serve repeated identical requests from an append-only cache.
    pub fn with_cache(mut self, cache: Arc<Storage>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Snapshot of the calls made so far.
    pub fn tally(&self) -> CallTally {
        self.tally.lock().map(|t| *t).unwrap_or_default()
    }

    fn count(&self, f: impl FnOnce(&mut CallTally)) {
        if let Ok(mut tally) = self.tally.lock() {
            f(&mut tally);
        }
    }

    fn count_failure(&self, failure: &CallFailure) {
        if failure.reached_network() {
            self.count(|t| t.failed_after_network += 1);
        } else {
            self.count(|t| t.failed_before_network += 1);
        }
    }

    /// One structured call returning `T`.
    ///
    /// `grounded` enables web search; `strict` appends the schema-compliance
    /// re-prompt used after a malformed answer.
    pub async fn invoke<T: CallResponse>(
        &self,
        prompt: &str,
        grounded: bool,
        strict: bool,
    ) -> Result<T, CallFailure> {
        if prompt.trim().is_empty() {
            let failure = CallFailure::InvalidRequest("prompt is empty".into());
            self.count_failure(&failure);
            return Err(failure);
        }

        let mut full_prompt = prompt.to_string();
        if strict {
            full_prompt.push_str(STRICT_SUFFIX);
        }
        let request = CallRequest {
            model: self.config.model.clone(),
            prompt: full_prompt,
            schema_name: T::response_name(),
            schema: T::strict_schema(),
            grounding: grounded.then_some(Grounding {
                max_results: self.config.search_results,
            }),
        };

        let key = cache_key(&request);
        if let Some(value) = self.cached::<T>(&key).await {
            self.count(|t| t.cache_hits += 1);
            return Ok(value);
        }

        debug!(schema = %request.schema_name, grounded, strict, "external call");
        let raw = match tokio::time::timeout(self.config.timeout, self.client.complete(&request)).await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(failure)) => {
                self.count_failure(&failure);
                return Err(failure);
            }
            Err(_) => {
                let failure = CallFailure::Timeout;
                self.count_failure(&failure);
                return Err(failure);
            }
        };
        self.count(|t| {
            t.tokens_in += raw.tokens_in;
            t.tokens_out += raw.tokens_out;
        });

        let value: T = match serde_json::from_str(&raw.content) {
            Ok(v) => v,
            Err(e) => {
                let failure = CallFailure::MalformedResponse(format!(
                    "{} does not match schema: {e}",
                    request.schema_name
                ));
                self.count_failure(&failure);
                return Err(failure);
            }
        };
        if !value.has_content() {
            let failure = CallFailure::EmptyResult(format!("{} has no usable content", request.schema_name));
            self.count_failure(&failure);
            return Err(failure);
        }

        self.count(|t| t.succeeded += 1);
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.cache_put(&key, &request.model, &raw.content).await {
                warn!(error = %e, "call cache write failed");
            }
        }
        Ok(value)
    }

    /// One image generation call.
    pub async fn image(&self, prompt: &str) -> Result<RawImage, CallFailure> {
        if prompt.trim().is_empty() {
            let failure = CallFailure::InvalidRequest("image prompt is empty".into());
            self.count_failure(&failure);
            return Err(failure);
        }
        let request = ImageRequest {
            model: self.config.image_model.clone(),
            prompt: prompt.to_string(),
        };

        let result = match tokio::time::timeout(
            self.config.timeout,
            self.client.generate_image(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CallFailure::Timeout),
        };

        let image = match result {
            Ok(image) => image,
            Err(failure) => {
                self.count_failure(&failure);
                return Err(failure);
            }
        };
        if image.url.trim().is_empty() {
            let failure = CallFailure::EmptyResult("image response has no URL".into());
            self.count_failure(&failure);
            return Err(failure);
        }
        self.count(|t| t.succeeded += 1);
        Ok(image)
    }

    /// Cached, parseable, non-empty answer for `key`.
    async fn cached<T: CallResponse>(&self, key: &str) -> Option<T> {
        let cache = self.cache.as_ref()?;
        match cache.cache_get(key).await {
            Ok(Some(json)) => serde_json::from_str::<T>(&json)
                .ok()
                .filter(|v| v.has_content()),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "call cache read failed");
                None
            }
        }
    }
}

/// sha256 over everything that determines the answer.
fn cache_key(request: &CallRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    hasher.update([0]);
    hasher.update(request.schema_name.as_bytes());
    hasher.update([0]);
    hasher.update(request.schema.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(request.prompt.as_bytes());
    hasher.update([0]);
    if let Some(g) = request.grounding {
        hasher.update(g.max_results.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
    struct Answer {
        items: Vec<String>,
    }

    impl CallResponse for Answer {
        fn has_content(&self) -> bool {
            !self.items.is_empty()
        }
    }

    fn config() -> AdapterConfig {
        AdapterConfig {
            model: "test/model".into(),
            image_model: "test/image".into(),
            timeout: Duration::from_millis(200),
            search_results: 3,
        }
    }

    #[tokio::test]
    async fn empty_prompt_never_reaches_client() {
        let client = Arc::new(ScriptedClient::new());
        let adapter = CallAdapter::new(client.clone(), config());

        let err = adapter.invoke::<Answer>("   ", false, false).await.unwrap_err();
        assert!(matches!(err, CallFailure::InvalidRequest(_)));
        assert_eq!(client.call_count(), 0);
        assert_eq!(adapter.tally().failed_before_network, 1);
    }

    #[tokio::test]
    async fn success_counts_and_passes_grounding() {
        let client = Arc::new(ScriptedClient::new());
        client.respond(&Answer {
            items: vec!["a".into()],
        });
        let adapter = CallAdapter::new(client.clone(), config());

        let answer = adapter.invoke::<Answer>("list things", true, false).await.unwrap();
        assert_eq!(answer.items, vec!["a"]);
        assert_eq!(adapter.tally().succeeded, 1);

        let calls = client.calls();
        assert_eq!(calls[0].schema_name, "Answer");
        assert_eq!(calls[0].grounding, Some(Grounding { max_results: 3 }));
    }

    #[tokio::test]
    async fn malformed_and_empty_are_distinguished() {
        let client = Arc::new(ScriptedClient::new());
        client.respond_raw::<Answer>(None, r#"{"items": "not a list"}"#);
        client.respond(&Answer { items: vec![] });
        let adapter = CallAdapter::new(client.clone(), config());

        let first = adapter.invoke::<Answer>("p", false, false).await.unwrap_err();
        assert!(matches!(first, CallFailure::MalformedResponse(_)));
        let second = adapter.invoke::<Answer>("p", false, true).await.unwrap_err();
        assert!(matches!(second, CallFailure::EmptyResult(_)));

        let tally = adapter.tally();
        assert_eq!(tally.succeeded, 0);
        assert_eq!(tally.failed_after_network, 2);
        assert!(client.calls()[1].prompt.ends_with(STRICT_SUFFIX));
    }

    #[tokio::test]
    async fn slow_client_times_out() {
        let client = Arc::new(ScriptedClient::new().with_delay(Duration::from_secs(2)));
        client.respond(&Answer {
            items: vec!["late".into()],
        });
        let adapter = CallAdapter::new(client, config());

        let err = adapter.invoke::<Answer>("p", false, false).await.unwrap_err();
        assert_eq!(err, CallFailure::Timeout);
        assert_eq!(adapter.tally().failed_after_network, 1);
    }

    #[tokio::test]
    async fn cache_serves_identical_requests() {
        let db = std::env::temp_dir().join(format!("af_cache_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db).await.unwrap());
        let client = Arc::new(ScriptedClient::new());
        client.respond(&Answer {
            items: vec!["x".into()],
        });

        let first = CallAdapter::new(client.clone(), config()).with_cache(storage.clone());
        first.invoke::<Answer>("same prompt", false, false).await.unwrap();

        let second = CallAdapter::new(client.clone(), config()).with_cache(storage);
        let cached = second.invoke::<Answer>("same prompt", false, false).await.unwrap();

        assert_eq!(cached.items, vec!["x"]);
        assert_eq!(client.call_count(), 1);
        assert_eq!(second.tally().cache_hits, 1);
        assert_eq!(second.tally().succeeded, 0);
    }

    #[tokio::test]
    async fn image_failures_are_counted() {
        let client = Arc::new(ScriptedClient::new());
        client.image_ok(None, "https://img.test/1.png");
        client.image_fail(None, CallFailure::RateLimited("busy".into()));
        let adapter = CallAdapter::new(client, config());

        assert!(adapter.image("a hero image").await.is_ok());
        assert!(adapter.image("a mid image").await.is_err());
        let tally = adapter.tally();
        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.failed_after_network, 1);
    }
}
