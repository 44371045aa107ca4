pub mod accumulate;
pub mod retry;
pub mod structured;

use std::sync::Arc;

use stepwise_core::config::AppConfig;
use stepwise_core::traits::LlmClient;

pub use accumulate::{collect_generation, generate};
pub use retry::RetryingClient;
pub use structured::{parse_structured, OutputCleaner};

/// Wrap a client with retries and fallbacks when the config asks for them.
pub fn with_retries(
    primary: Arc<dyn LlmClient>,
    fallbacks: Vec<Arc<dyn LlmClient>>,
    config: &AppConfig,
) -> Arc<dyn LlmClient> {
    if config.model.retry.is_none() && fallbacks.is_empty() {
        return primary;
    }
    Arc::new(RetryingClient::from_config(primary, fallbacks, config))
}
