/// Retry executor with exponential backoff
///
/// Wraps a single handler invocation. After failed attempt `i` (0-based) it
/// waits `base_delay * 2^i` before the next one, so three attempts wait
/// base, then 2×base. Shutdown wins over backoff: a cancelled token aborts
/// the wait and no further attempt is made.

use crate::config::RetryConfig;
use crate::error::EngineError;
use crate::runtime::actions::{ActionError, ActionHandler};
use crate::workflow::types::ActionParams;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded retry policy for action steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least one attempt is always made
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after the failed attempt with 0-based index `attempt_index`
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_secs(config.base_delay_secs))
    }
}

/// Terminal result of a retried invocation
#[derive(Debug)]
pub struct RetryOutcome {
    /// Handler invocations actually made
    pub attempts: u32,
    pub result: Result<Value, EngineError>,
}

/// Invoke `handler` until it succeeds, the policy is exhausted or shutdown
/// is requested. Every handler error counts as a failed attempt.
///
/// The last error is returned as `ActionExecutionFailure`; earlier errors are
/// only logged. Cancellation during a backoff wait returns
/// `ShutdownInProgress`.
pub async fn execute_with_retry(
    action_type: &str,
    handler: &dyn ActionHandler,
    params: &ActionParams,
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
) -> RetryOutcome {
    let mut attempt_index = 0;

    loop {
        let attempts = attempt_index + 1;
        let error = match handler.execute(params).await {
            Ok(output) => {
                if attempt_index > 0 {
                    tracing::info!("✅ Action '{}' succeeded on attempt {}", action_type, attempts);
                }
                return RetryOutcome {
                    attempts,
                    result: Ok(output),
                };
            }
            Err(e) => e,
        };

        if attempts >= policy.max_attempts {
            tracing::error!(
                "❌ Final attempt failed for '{}' ({}/{}): {}",
                action_type,
                attempts,
                policy.max_attempts,
                error
            );
            return RetryOutcome {
                attempts,
                result: Err(exhausted(action_type, attempts, &error)),
            };
        }

        let wait = policy.backoff(attempt_index);
        tracing::warn!(
            "⚠️ Action '{}' failed. Retrying in {:?}... (Attempt {}/{}): {}",
            action_type,
            wait,
            attempts,
            policy.max_attempts,
            error
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::warn!("🛑 Shutdown requested, abandoning retries for '{}'", action_type);
                return RetryOutcome {
                    attempts,
                    result: Err(EngineError::ShutdownInProgress),
                };
            }
            _ = tokio::time::sleep(wait) => {}
        }

        attempt_index += 1;
    }
}

fn exhausted(action_type: &str, attempts: u32, error: &ActionError) -> EngineError {
    EngineError::ActionExecutionFailure {
        action_type: action_type.to_string(),
        attempts,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{params, MockAction};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(base_secs: u64) -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(base_secs))
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = policy(2);
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_short_circuits() {
        let handler = MockAction::returning(json!({ "ok": true }));
        let outcome = execute_with_retry(
            "mock",
            &handler,
            &params(json!({})),
            &policy(2),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap(), json!({ "ok": true }));
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let handler = MockAction::failing_then_returning(2, json!("done"));
        let outcome = execute_with_retry(
            "flaky",
            &handler,
            &params(json!({})),
            &policy(1),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_wait_the_geometric_sum() {
        let handler = MockAction::failing("smtp down");
        let started = Instant::now();

        let outcome = execute_with_retry(
            "email",
            &handler,
            &params(json!({})),
            &policy(2),
            &CancellationToken::new(),
        )
        .await;

        // base * (2^0 + 2^1) = 2s + 4s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(6_050), "waited {elapsed:?}");
        assert_eq!(handler.call_count(), 3);
        assert_eq!(outcome.attempts, 3);
        match outcome.result {
            Err(EngineError::ActionExecutionFailure { attempts, message, .. }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("smtp down"));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_params_use_every_attempt() {
        let handler = MockAction::rejecting("missing 'to'");
        let outcome = execute_with_retry(
            "email",
            &handler,
            &params(json!({})),
            &policy(2),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(handler.call_count(), 3);
        match outcome.result {
            Err(EngineError::ActionExecutionFailure { attempts, message, .. }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("missing 'to'"));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_pending_backoff() {
        let handler = Arc::new(MockAction::failing("still down"));
        let token = CancellationToken::new();

        let task = {
            let handler = Arc::clone(&handler);
            let token = token.clone();
            tokio::spawn(async move {
                execute_with_retry(
                    "email",
                    handler.as_ref(),
                    &ActionParams::new(),
                    &RetryPolicy::new(5, Duration::from_secs(60)),
                    &token,
                )
                .await
            })
        };

        // First attempt fails immediately; the executor is now in its 60s backoff.
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(EngineError::ShutdownInProgress)));

        // No further attempts once cancelled, even after the old backoff would have elapsed.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(handler.call_count(), 1);
    }
}
