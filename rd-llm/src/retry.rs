use crate::client::ChatBackend;
use crate::error::Result;
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests and one-shot tooling.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.base_delay.min(self.max_delay);
        }
        let exp_shift = (attempt - 1).min(30) as u32;
        let base_ms = self.base_delay.as_millis() as u64;
        let raw_ms = base_ms.saturating_mul(1u64 << exp_shift);
        Duration::from_millis(raw_ms).min(self.max_delay)
    }
}

/// Runs one completion turn with bounded retries. Only retryable errors are
/// retried; the last error is returned once the attempt budget is spent.
#[tracing::instrument(level = "info", skip_all, fields(max_attempts = policy.max_attempts))]
pub async fn chat_with_retry(
    backend: &dyn ChatBackend,
    messages: &[ChatMessage],
    policy: RetryPolicy,
) -> Result<ChatResponse> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match backend.chat(messages).await {
            Ok(resp) => {
                if attempt > 1 {
                    tracing::info!(attempt, "completion succeeded after retry");
                }
                return Ok(resp);
            }
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "completion failed; retrying with backoff"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                tracing::error!(attempt, max_attempts, %error, "completion failed terminally");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::types::Usage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBackend {
        script: Mutex<Vec<Result<ChatResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(mut script: Vec<Result<ChatResponse>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .expect("script lock")
                .pop()
                .unwrap_or_else(|| Err(LlmError::Http("script exhausted".to_string())))
        }
    }

    fn ok(text: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            message: ChatMessage::assistant(text),
            usage: Usage::default(),
            finish_reason: "stop".to_string(),
        })
    }

    #[test]
    fn default_backoff_doubles_from_one_second_and_caps_at_ten() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Http("connection reset".to_string())),
            Err(LlmError::Status {
                status: 503,
                body: "busy".to_string(),
            }),
            ok("Bonjour"),
        ]);
        let resp = chat_with_retry(&backend, &[ChatMessage::user("hi")], RetryPolicy::immediate(3))
            .await
            .expect("third attempt succeeds");
        assert_eq!(resp.message.content, "Bonjour");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Http("down".to_string())),
            Err(LlmError::Http("down".to_string())),
            Err(LlmError::Http("still down".to_string())),
            ok("too late"),
        ]);
        let err = chat_with_retry(&backend, &[ChatMessage::user("hi")], RetryPolicy::immediate(3))
            .await
            .expect_err("budget exhausted");
        assert!(err.to_string().contains("still down"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn format_errors_are_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::ResponseFormat("garbage".to_string())),
            ok("unreachable"),
        ]);
        let err = chat_with_retry(&backend, &[ChatMessage::user("hi")], RetryPolicy::immediate(3))
            .await
            .expect_err("not retried");
        assert!(matches!(err, LlmError::ResponseFormat(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
