//! Built-in steps.

pub mod agent;
pub mod branching;
pub mod catch;
pub mod end;
pub mod map;
pub mod messages;
pub mod parallel;
pub mod prompt;
pub mod retry;
pub mod subflow;
pub mod template;
pub mod tool;
pub mod transform;
pub mod variable;

use stepwise_core::property::Property;
use stepwise_core::template::SimpleRenderer;
use stepwise_core::traits::Renderer;

pub use agent::AgentExecutionStep;
pub use branching::{BranchingStep, Choice, ChoiceSelectionStep, DEFAULT_CHOICE};
pub use catch::CatchExceptionStep;
pub use end::EndStep;
pub use map::MapStep;
pub use messages::{InputMessageStep, OutputMessageStep};
pub use parallel::ParallelFlowExecutionStep;
pub use prompt::PromptExecutionStep;
pub use retry::RetryStep;
pub use subflow::FlowExecutionStep;
pub use template::TemplateRenderingStep;
pub use tool::ToolExecutionStep;
pub use transform::TransformMessagesStep;
pub use variable::{VariableReadStep, VariableWriteStep};

/// One input per distinct placeholder root in `template`.
pub(crate) fn template_inputs(template: &str) -> Vec<Property> {
    SimpleRenderer
        .placeholders(template)
        .into_iter()
        .map(Property::any)
        .collect()
}
