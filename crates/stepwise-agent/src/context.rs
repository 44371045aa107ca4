use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use stepwise_core::config::{AppConfig, FlowConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::{EventBus, ExecutionEvent};
use stepwise_core::template::SimpleRenderer;
use stepwise_core::traits::Renderer;
use stepwise_core::types::{TokenUsage, UsageSink, ValueMap};

use crate::interrupt::{ExecutionInterrupt, InterruptState, TimeoutInterrupt, TokenBudgetInterrupt};

/// Everything one `execute()` call tree shares: event listeners, interrupts,
/// the template renderer, a cancellation token, and token accounting.
/// Clones share the same bus, token and usage counter.
#[derive(Clone)]
pub struct ExecutionContext {
    events: Arc<EventBus>,
    interrupts: Vec<Arc<dyn ExecutionInterrupt>>,
    renderer: Arc<dyn Renderer>,
    cancel: CancellationToken,
    started: Instant,
    usage: Arc<Mutex<TokenUsage>>,
    limits: FlowConfig,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            events: Arc::new(EventBus::default()),
            interrupts: Vec::new(),
            renderer: Arc::new(SimpleRenderer),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            usage: Arc::new(Mutex::new(TokenUsage::default())),
            limits: FlowConfig::default(),
        }
    }

    /// Context with the interrupts and flow limits the config asks for.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut ctx = Self::new().with_limits(config.flow.clone());
        if let Some(secs) = config.interrupts.timeout_secs {
            ctx = ctx.with_interrupt(TimeoutInterrupt::secs(secs));
        }
        if let Some(budget) = config.interrupts.token_budget {
            ctx = ctx.with_interrupt(TokenBudgetInterrupt::new(budget));
        }
        ctx
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_interrupt(mut self, interrupt: impl ExecutionInterrupt) -> Self {
        self.interrupts.push(Arc::new(interrupt));
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_limits(mut self, limits: FlowConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Same listeners, interrupts and limits, with the clock and usage
    /// counter restarted. For nested runs that are not part of this tree.
    pub fn fresh_run(&self) -> Self {
        Self {
            started: Instant::now(),
            usage: Arc::new(Mutex::new(TokenUsage::default())),
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn publish(&self, event: ExecutionEvent) {
        self.events.publish(event);
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    pub fn render(&self, template: &str, bindings: &ValueMap) -> Result<String> {
        self.renderer.render(template, bindings)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn limits(&self) -> &FlowConfig {
        &self.limits
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }

    pub fn record_usage(&self, usage: TokenUsage) {
        if usage.total() == 0 {
            return;
        }
        if let Ok(mut total) = self.usage.lock() {
            total.add(usage);
        }
        self.publish(ExecutionEvent::UsageUpdate {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        });
    }

    /// Run every interrupt. Called at step and iteration boundaries only.
    pub fn check_interrupts(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StepwiseError::Cancelled);
        }
        let state = InterruptState {
            started: self.started,
            usage: self.usage(),
        };
        for interrupt in &self.interrupts {
            if let Some(reason) = interrupt.check(&state) {
                warn!(interrupt = interrupt.name(), %reason, "Execution interrupted");
                self.publish(ExecutionEvent::Interrupted {
                    reason: reason.clone(),
                });
                return Err(StepwiseError::Interrupted(reason));
            }
        }
        Ok(())
    }
}

impl UsageSink for ExecutionContext {
    fn record_usage(&self, usage: TokenUsage) {
        ExecutionContext::record_usage(self, usage);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("interrupts", &self.interrupts.iter().map(|i| i.name()).collect::<Vec<_>>())
            .field("usage", &self.usage())
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_checked_against_recorded_usage() {
        let ctx = ExecutionContext::new().with_interrupt(TokenBudgetInterrupt::new(50));
        assert!(ctx.check_interrupts().is_ok());
        ctx.record_usage(TokenUsage::new(30, 25));
        let err = ctx.check_interrupts().unwrap_err();
        assert!(matches!(err, StepwiseError::Interrupted(_)));
    }

    #[test]
    fn test_clones_share_usage_and_cancellation() {
        let ctx = ExecutionContext::new();
        let clone = ctx.clone();
        clone.record_usage(TokenUsage::new(1, 2));
        assert_eq!(ctx.usage().total(), 3);

        ctx.cancel_token().cancel();
        assert!(matches!(clone.check_interrupts(), Err(StepwiseError::Cancelled)));
    }

    #[test]
    fn test_fresh_run_restarts_usage_but_follows_cancellation() {
        let ctx = ExecutionContext::new();
        ctx.record_usage(TokenUsage::new(5, 5));
        let nested = ctx.fresh_run();
        assert_eq!(nested.usage().total(), 0);

        ctx.cancel_token().cancel();
        assert!(matches!(nested.check_interrupts(), Err(StepwiseError::Cancelled)));
    }

    #[test]
    fn test_from_config() {
        let mut config = AppConfig::default();
        config.interrupts.token_budget = Some(10);
        config.flow.max_transitions = 7;
        let ctx = ExecutionContext::from_config(&config);
        assert_eq!(ctx.limits().max_transitions, 7);
        ctx.record_usage(TokenUsage::new(10, 0));
        assert!(ctx.check_interrupts().is_err());
    }
}
