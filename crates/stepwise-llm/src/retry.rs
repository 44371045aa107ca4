use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use rand::Rng;
use tracing::{debug, info, warn};

use stepwise_core::config::{AppConfig, ModelConfig, RetryConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::LlmClient;
use stepwise_core::types::{Prompt, StreamDelta};

type DeltaStream<'a> = BoxStream<'a, Result<StreamDelta>>;

/// Substrings of provider errors worth another attempt.
const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "500",
    "502",
    "503",
    "504",
    "overloaded",
    "timeout",
    "timed out",
    "connection",
];

/// Retries the primary client on transient failures, then walks the
/// fallback chain in order. Each fallback gets one attempt with its own
/// model settings.
pub struct RetryingClient {
    primary: Arc<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Arc<dyn LlmClient>)>,
    policy: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Arc<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Arc<dyn LlmClient>)>,
        policy: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            policy,
        }
    }

    /// Pair `fallbacks` with `[[fallback_models]]` by position and take the
    /// policy from `[model.retry]`, or its defaults.
    pub fn from_config(
        primary: Arc<dyn LlmClient>,
        fallbacks: Vec<Arc<dyn LlmClient>>,
        config: &AppConfig,
    ) -> Self {
        if fallbacks.len() != config.fallback_models.len() {
            warn!(
                clients = fallbacks.len(),
                configured = config.fallback_models.len(),
                "Fallback clients and fallback_models differ in length; extras ignored"
            );
        }
        let fallbacks = config
            .fallback_models
            .iter()
            .cloned()
            .zip(fallbacks)
            .collect();
        Self::new(primary, fallbacks, config.model.retry.clone().unwrap_or_default())
    }

    async fn from_primary(&self, config: &ModelConfig, prompt: &Prompt) -> Result<DeltaStream<'_>> {
        let mut attempt = 0;
        loop {
            let err = match self.primary.chat_stream(config, prompt.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };
            if !is_transient(&err) || attempt >= self.policy.max_retries {
                debug!(attempt, error = %err, "Primary LLM gave up");
                return Err(err);
            }
            let delay = backoff_delay(&self.policy, attempt);
            attempt += 1;
            warn!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient LLM failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn from_fallbacks(&self, prompt: &Prompt, primary_err: StepwiseError) -> Result<DeltaStream<'_>> {
        let mut last = primary_err;
        for (model, client) in &self.fallbacks {
            match client.chat_stream(model, prompt.clone()).await {
                Ok(stream) => {
                    info!(model = %model.model_id, "Using fallback model");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(model = %model.model_id, error = %e, "Fallback model failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

fn is_transient(e: &StepwiseError) -> bool {
    match e {
        StepwiseError::LlmStream(_) => true,
        StepwiseError::LlmRequest(msg) => {
            let msg = msg.to_ascii_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| msg.contains(m))
        }
        _ => false,
    }
}

/// Exponential delay capped at `max_backoff_ms`, scaled by a random
/// factor in `[0.8, 1.2)`.
fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let base = policy
        .initial_backoff_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(policy.max_backoff_ms);
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base as f64 * factor) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        prompt: Prompt,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        Box::pin(async move {
            match self.from_primary(&config, &prompt).await {
                Ok(stream) => Ok(stream),
                Err(e) if self.fallbacks.is_empty() => Err(e),
                Err(e) => {
                    info!(error = %e, "Primary LLM exhausted, trying fallbacks");
                    self.from_fallbacks(&prompt, e).await
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    struct Flaky {
        failures: usize,
        error: &'static str,
        calls: AtomicUsize,
        reply: &'static str,
    }

    impl Flaky {
        fn new(failures: usize, error: &'static str, reply: &'static str) -> Self {
            Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
                reply,
            }
        }
    }

    impl LlmClient for Flaky {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            _prompt: Prompt,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < self.failures {
                    return Err(StepwiseError::LlmRequest(self.error.to_string()));
                }
                let deltas = vec![Ok(StreamDelta::TextDelta(self.reply.to_string()))];
                Ok(futures::stream::iter(deltas).boxed())
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    async fn first_text(client: &RetryingClient) -> Result<String> {
        let mut stream = client
            .chat_stream(&ModelConfig::default(), Prompt::default())
            .await?;
        match stream.next().await {
            Some(Ok(StreamDelta::TextDelta(t))) => Ok(t),
            _ => Err(StepwiseError::LlmStream("empty".into())),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert!(backoff_delay(&config, 8) <= Duration::from_millis(1200));
        assert!(backoff_delay(&config, 0) >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let primary = Arc::new(Flaky::new(2, "HTTP 503", "ok"));
        let client = RetryingClient::new(primary.clone(), vec![], fast_retry(3));
        assert_eq!(first_text(&client).await.unwrap(), "ok");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_goes_to_fallback() {
        let primary = Arc::new(Flaky::new(usize::MAX, "HTTP 401 unauthorized", "never"));
        let fallback = Arc::new(Flaky::new(0, "", "from fallback"));
        let client = RetryingClient::new(
            primary.clone(),
            vec![(ModelConfig::default(), fallback as Arc<dyn LlmClient>)],
            fast_retry(3),
        );
        assert_eq!(first_text(&client).await.unwrap(), "from fallback");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&StepwiseError::LlmRequest("Server Overloaded".into())));
        assert!(is_transient(&StepwiseError::LlmStream("reset".into())));
        assert!(!is_transient(&StepwiseError::LlmRequest("HTTP 400 bad request".into())));
        assert!(!is_transient(&StepwiseError::Config("429".into())));
    }

    #[tokio::test]
    async fn test_from_config_pairs_fallbacks_by_position() {
        let mut config = AppConfig::default();
        config.model.retry = Some(fast_retry(0));
        config.fallback_models = vec![ModelConfig {
            model_id: "small-model".into(),
            ..ModelConfig::default()
        }];
        let primary = Arc::new(Flaky::new(usize::MAX, "HTTP 503", "never"));
        let fallback = Arc::new(Flaky::new(0, "", "small"));
        let client = RetryingClient::from_config(
            primary.clone(),
            vec![fallback as Arc<dyn LlmClient>],
            &config,
        );

        assert_eq!(first_text(&client).await.unwrap(), "small");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_fail_returns_last_error() {
        let primary = Arc::new(Flaky::new(usize::MAX, "HTTP 500", "never"));
        let client = RetryingClient::new(primary, vec![], fast_retry(1));
        let err = first_text(&client).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
