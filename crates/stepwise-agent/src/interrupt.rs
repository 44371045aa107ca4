//! Soft execution interrupts, checked only at step and iteration
//! boundaries. They never preempt an in-flight LLM or tool call.

use std::time::{Duration, Instant};

use stepwise_core::types::{InterruptReason, TokenUsage};

/// Snapshot handed to interrupts at a boundary.
#[derive(Debug, Clone, Copy)]
pub struct InterruptState {
    pub started: Instant,
    pub usage: TokenUsage,
}

pub trait ExecutionInterrupt: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// `Some` when execution must stop.
    fn check(&self, state: &InterruptState) -> Option<InterruptReason>;
}

/// Stops once wall-clock time since the context was created exceeds a limit.
#[derive(Debug, Clone)]
pub struct TimeoutInterrupt {
    limit: Duration,
}

impl TimeoutInterrupt {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

impl ExecutionInterrupt for TimeoutInterrupt {
    fn name(&self) -> &str {
        "timeout"
    }

    fn check(&self, state: &InterruptState) -> Option<InterruptReason> {
        let elapsed = state.started.elapsed();
        (elapsed >= self.limit).then(|| InterruptReason::Timeout {
            elapsed_secs: elapsed.as_secs(),
            limit_secs: self.limit.as_secs(),
        })
    }
}

/// Stops once cumulative LLM token usage crosses a budget.
#[derive(Debug, Clone)]
pub struct TokenBudgetInterrupt {
    budget: u64,
}

impl TokenBudgetInterrupt {
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }
}

impl ExecutionInterrupt for TokenBudgetInterrupt {
    fn name(&self) -> &str {
        "token_budget"
    }

    fn check(&self, state: &InterruptState) -> Option<InterruptReason> {
        let used = state.usage.total();
        (used >= self.budget).then_some(InterruptReason::TokenBudget {
            used,
            budget: self.budget,
        })
    }
}
