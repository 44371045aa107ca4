pub mod agent;
pub mod calls;
pub mod component;
pub mod context;
pub mod conversation;
pub mod flow;
pub mod flow_tool;
pub mod interrupt;
pub mod model;
pub mod multi;
pub mod registry;
pub mod status;
pub mod steps;
pub mod tokens;
pub mod transforms;
pub mod variables;

pub use agent::{Agent, AgentBuilder, AgentState, CallerInputMode, ToolErrorPolicy};
pub use component::{ConversationalComponent, Scope};
pub use context::ExecutionContext;
pub use conversation::{ComponentState, Conversation};
pub use flow::{ControlFlowEdge, DataEndpoint, DataFlowEdge, Flow, FlowBuilder, FlowState, Step};
pub use flow_tool::FlowTool;
pub use interrupt::{ExecutionInterrupt, TimeoutInterrupt, TokenBudgetInterrupt};
pub use model::LlmHandle;
pub use multi::{HandoffMode, ManagerWorkers, Swarm, SwarmBuilder};
pub use registry::ComponentRegistry;
pub use status::{Awaiting, ExecutionStatus};
pub use transforms::{
    ConversationSummarizationTransform, MessageSummarizationTransform, MessageTransform,
    TokenBudgetTransform,
};
pub use variables::{VariableStore, WriteOperation};
