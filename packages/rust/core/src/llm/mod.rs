//! External call adapter.
//!
//! Every AI call in the pipeline goes through a [`CallAdapter`]: prompt text
//! in, a typed structured result out, or a classified [`CallFailure`]. The
//! adapter makes exactly one provider call per invocation and never retries
//! on its own; retry policy lives in [`crate::retry`].
//!
//! The provider itself sits behind the [`GenerationClient`] trait so stages
//! can be exercised against [`crate::testing::ScriptedClient`].

mod adapter;
mod openrouter;
mod schema;

use async_trait::async_trait;

use articleforge_shared::{ArticleForgeError, ErrorKind};

pub use adapter::{AdapterConfig, CallAdapter};
pub use openrouter::OpenRouterClient;
pub use schema::{CallResponse, StructuredOutput};

// ---------------------------------------------------------------------------
// Requests and raw responses
// ---------------------------------------------------------------------------

/// Web-search grounding options for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grounding {
    pub max_results: u32,
}

/// One structured completion request, fully built.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub model: String,
    pub prompt: String,
    /// Name of the response type, used as the schema name.
    pub schema_name: String,
    /// Strict JSON schema the response must satisfy.
    pub schema: serde_json::Value,
    pub grounding: Option<Grounding>,
}

/// Provider answer before parsing.
#[derive(Debug, Clone, Default)]
pub struct RawCompletion {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
}

/// A generated image: a hosted URL or a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub url: String,
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Why a single call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Timeout,
    RateLimited(String),
    /// A response arrived but does not match the requested shape.
    MalformedResponse(String),
    /// Non-2xx status, auth failure, or transport error.
    RemoteError { status: Option<u16>, message: String },
    /// Well-formed but without usable content.
    EmptyResult(String),
    /// Rejected before any network use.
    InvalidRequest(String),
}

impl CallFailure {
    /// Position in the pipeline failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout | Self::RateLimited(_) => ErrorKind::TransientExternal,
            Self::MalformedResponse(_) => ErrorKind::MalformedExternal,
            Self::RemoteError { .. } | Self::EmptyResult(_) => ErrorKind::PermanentExternal,
            Self::InvalidRequest(_) => ErrorKind::ContractViolation,
        }
    }

    /// Whether the provider saw the request (and quota was likely consumed).
    pub fn reached_network(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => false,
            Self::RemoteError { status, .. } => status.is_some(),
            _ => true,
        }
    }

    pub fn into_error(self, stage: &str) -> ArticleForgeError {
        let kind = self.kind();
        ArticleForgeError::from_kind(kind, stage, self.to_string())
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::RateLimited(m) => write!(f, "rate limited: {m}"),
            Self::MalformedResponse(m) => write!(f, "malformed response: {m}"),
            Self::RemoteError {
                status: Some(status),
                message,
            } => write!(f, "remote error (HTTP {status}): {message}"),
            Self::RemoteError {
                status: None,
                message,
            } => write!(f, "remote error: {message}"),
            Self::EmptyResult(m) => write!(f, "empty result: {m}"),
            Self::InvalidRequest(m) => write!(f, "invalid request: {m}"),
        }
    }
}

impl std::error::Error for CallFailure {}

// ---------------------------------------------------------------------------
// Provider seam
// ---------------------------------------------------------------------------

/// A structured-generation provider.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// One structured completion. Must not retry internally.
    async fn complete(&self, request: &CallRequest) -> Result<RawCompletion, CallFailure>;

    /// One image generation.
    async fn generate_image(&self, request: &ImageRequest) -> Result<RawImage, CallFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_follow_taxonomy() {
        assert_eq!(CallFailure::Timeout.kind(), ErrorKind::TransientExternal);
        assert_eq!(CallFailure::RateLimited("slow down".into()).kind(), ErrorKind::TransientExternal);
        assert_eq!(CallFailure::MalformedResponse("x".into()).kind(), ErrorKind::MalformedExternal);
        assert_eq!(CallFailure::EmptyResult("x".into()).kind(), ErrorKind::PermanentExternal);
        assert_eq!(
            CallFailure::InvalidRequest("empty prompt".into()).kind(),
            ErrorKind::ContractViolation
        );
    }

    #[test]
    fn network_accounting() {
        assert!(!CallFailure::InvalidRequest("x".into()).reached_network());
        assert!(
            !CallFailure::RemoteError {
                status: None,
                message: "connection refused".into()
            }
            .reached_network()
        );
        assert!(
            CallFailure::RemoteError {
                status: Some(401),
                message: "unauthorized".into()
            }
            .reached_network()
        );
        assert!(CallFailure::Timeout.reached_network());
    }

    #[test]
    fn into_error_carries_stage() {
        let err = CallFailure::Timeout.into_error("generate");
        assert_eq!(err.kind(), ErrorKind::TransientExternal);
        assert_eq!(err.stage(), Some("generate"));
    }
}
