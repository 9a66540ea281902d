//! Retry policy around external calls.
//!
//! - `TransientExternal` (timeout, rate limit): retried with exponential
//!   backoff until `max_attempts` total attempts.
//! - `MalformedExternal`: retried `malformed_retries` times, each with the
//!   strict re-prompt and no delay.
//! - Anything else returns at once.
//!
//! A retryable failure still failing when its budget runs out is promoted to
//! `PermanentExternal` for the stage.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use articleforge_shared::{ArticleForgeError, ErrorKind, Result, RetryConfig, StageName};

use crate::llm::CallFailure;

/// One attempt handed to the retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number across all failure kinds.
    pub number: u32,
    /// Set after a malformed response: the prompt must ask for strict compliance.
    pub strict: bool,
}

/// Backoff before transient retry `n` (1-based): `base * 2^(n-1)`, capped.
pub fn backoff(policy: &RetryConfig, n: u32) -> Duration {
    let factor = 1u64 << n.saturating_sub(1).min(16);
    Duration::from_millis(
        policy
            .base_delay_ms
            .saturating_mul(factor)
            .min(policy.max_delay_ms),
    )
}

/// Run `op` under the retry policy, returning the last raw failure when the
/// budget runs out or the failure is not retryable.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryConfig,
    stage: StageName,
    mut op: F,
) -> std::result::Result<T, CallFailure>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = std::result::Result<T, CallFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut transient = 0u32;
    let mut malformed = 0u32;
    let mut attempt = Attempt {
        number: 1,
        strict: false,
    };

    loop {
        let failure = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        match failure.kind() {
            ErrorKind::TransientExternal => {
                transient += 1;
                if transient >= max_attempts {
                    warn!(%stage, attempts = transient, error = %failure, "transient retries exhausted");
                    return Err(failure);
                }
                let delay = backoff(policy, transient);
                debug!(%stage, attempt = attempt.number, delay_ms = delay.as_millis() as u64, error = %failure, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
            ErrorKind::MalformedExternal => {
                malformed += 1;
                if malformed > policy.malformed_retries {
                    warn!(%stage, error = %failure, "malformed response after strict re-prompt");
                    return Err(failure);
                }
                debug!(%stage, attempt = attempt.number, "re-prompting after malformed response");
                attempt.strict = true;
            }
            _ => return Err(failure),
        }
        attempt.number += 1;
    }
}

/// [`call_with_retry`] with the final failure classified for `stage`.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, stage: StageName, op: F) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = std::result::Result<T, CallFailure>>,
{
    call_with_retry(policy, stage, op)
        .await
        .map_err(|failure| promote(failure, stage))
}

/// Classify a final failure, promoting retryable kinds to permanent.
pub fn promote(failure: CallFailure, stage: StageName) -> ArticleForgeError {
    let retryable = failure.kind().is_retryable();
    let err = failure.into_error(stage.as_str());
    if retryable { err.into_permanent() } else { err }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn policy() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            malformed_retries: 1,
        }
    }

    /// Replays `script` in order, recording every attempt.
    async fn run(
        script: Vec<std::result::Result<u32, CallFailure>>,
    ) -> (Result<u32>, Vec<Attempt>) {
        let script = Mutex::new(script.into_iter());
        let seen = Mutex::new(Vec::new());
        let result = with_retry(&policy(), StageName::Generate, |attempt| {
            seen.lock().unwrap().push(attempt);
            let next = script.lock().unwrap().next();
            async move { next.unwrap_or(Err(CallFailure::Timeout)) }
        })
        .await;
        (result, seen.into_inner().unwrap())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryConfig {
            base_delay_ms: 500,
            max_delay_ms: 8000,
            ..RetryConfig::default()
        };
        assert_eq!(backoff(&policy, 1), Duration::from_millis(500));
        assert_eq!(backoff(&policy, 2), Duration::from_millis(1000));
        assert_eq!(backoff(&policy, 4), Duration::from_millis(4000));
        assert_eq!(backoff(&policy, 9), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn transient_then_success() {
        let (result, seen) = run(vec![
            Err(CallFailure::RateLimited("busy".into())),
            Err(CallFailure::Timeout),
            Ok(7),
        ])
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|a| !a.strict));
    }

    #[tokio::test]
    async fn transient_exhaustion_is_permanent() {
        let (result, seen) = run(vec![
            Err(CallFailure::Timeout),
            Err(CallFailure::Timeout),
            Err(CallFailure::Timeout),
            Ok(1),
        ])
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentExternal);
        assert_eq!(err.stage(), Some("generate"));
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn malformed_retries_once_with_strict_prompt() {
        let (result, seen) = run(vec![
            Err(CallFailure::MalformedResponse("bad".into())),
            Ok(2),
        ])
        .await;
        assert_eq!(result.unwrap(), 2);
        assert!(!seen[0].strict);
        assert!(seen[1].strict);

        let (result, seen) = run(vec![
            Err(CallFailure::MalformedResponse("bad".into())),
            Err(CallFailure::MalformedResponse("still bad".into())),
            Ok(3),
        ])
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::PermanentExternal);
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (result, seen) = run(vec![
            Err(CallFailure::RemoteError {
                status: Some(401),
                message: "unauthorized".into(),
            }),
            Ok(1),
        ])
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::PermanentExternal);
        assert_eq!(seen.len(), 1);

        let (result, seen) = run(vec![Err(CallFailure::InvalidRequest("empty".into()))]).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ContractViolation);
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn raw_variant_keeps_empty_result() {
        let result = call_with_retry(&policy(), StageName::Verify, |_| async {
            Err::<u32, _>(CallFailure::EmptyResult("nothing found".into()))
        })
        .await;
        assert!(matches!(result, Err(CallFailure::EmptyResult(_))));
    }
}
