use std::time::Duration;

use crate::provider::{
    CompletionRequest, CompletionService, NoContentSnafu, ProviderResult,
};

/// Bounded retry for the completion call. Only transient failures are
/// retried; a blank success body counts as transient too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `failed_attempt` (1-based):
    /// base * 2^attempt, so 2s then 4s with the default base.
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(failed_attempt)
    }
}

pub async fn complete_with_retry(
    service: &dyn CompletionService,
    request: CompletionRequest,
    policy: RetryPolicy,
) -> ProviderResult<String> {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let outcome = service.complete(request.clone()).await;

        let error = match outcome {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => NoContentSnafu {
                stage: "retry-blank-response",
            }
            .build(),
            Err(error) => error,
        };

        if attempt >= max_attempts || !error.is_retryable() {
            return Err(error);
        }

        let delay = policy.backoff_delay(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "completion attempt failed; backing off before retry"
        );
        tokio::time::sleep(delay).await;
    }

    // The loop always returns from its final iteration.
    unreachable!("retry loop exited without a result")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::provider::{BoxFuture, ProviderError, Turn, TurnRole};

    /// Fake service that plays back a scripted sequence of outcomes.
    struct ScriptedService {
        script: Mutex<Vec<ProviderResult<String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedService {
        fn new(script: Vec<ProviderResult<String>>) -> Self {
            let mut reversed = script;
            reversed.reverse();
            Self {
                script: Mutex::new(reversed),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl CompletionService for ScriptedService {
        fn complete<'a>(
            &'a self,
            _request: CompletionRequest,
        ) -> BoxFuture<'a, ProviderResult<String>> {
            *self.calls.lock().unwrap() += 1;
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("unscripted".to_string()));
            Box::pin(async move { next })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Turn::new(TurnRole::User, "hi")], "system")
    }

    #[tokio::test]
    async fn rate_limited_twice_then_success_returns_on_third_attempt() {
        let service = ScriptedService::new(vec![
            Err(ProviderError::RateLimited { stage: "test" }),
            Err(ProviderError::RateLimited { stage: "test" }),
            Ok("finally".to_string()),
        ]);

        let reply = complete_with_retry(&service, request(), fast_policy())
            .await
            .unwrap();
        assert_eq!(reply, "finally");
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn unauthorized_fails_on_first_attempt() {
        let service = ScriptedService::new(vec![
            Err(ProviderError::Unauthorized { stage: "test" }),
            Ok("never reached".to_string()),
        ]);

        let result = complete_with_retry(&service, request(), fast_policy()).await;
        assert!(matches!(result, Err(ProviderError::Unauthorized { .. })));
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn blank_body_is_retried_as_transient() {
        let service = ScriptedService::new(vec![
            Ok("   ".to_string()),
            Ok("real reply".to_string()),
        ]);

        let reply = complete_with_retry(&service, request(), fast_policy())
            .await
            .unwrap();
        assert_eq!(reply, "real reply");
        assert_eq!(service.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let service = ScriptedService::new(vec![
            Err(ProviderError::ServerError {
                stage: "test",
                status: 503,
            }),
            Err(ProviderError::ServerError {
                stage: "test",
                status: 503,
            }),
            Err(ProviderError::ServerError {
                stage: "test",
                status: 500,
            }),
        ]);

        let result = complete_with_retry(&service, request(), fast_policy()).await;
        assert!(matches!(
            result,
            Err(ProviderError::ServerError { status: 500, .. })
        ));
        assert_eq!(service.call_count(), 3);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
    }
}
