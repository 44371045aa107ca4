use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::message::{Message, MessageType, ToolRequest, ToolResult};
use stepwise_core::property::coerce_values;
use stepwise_core::traits::Tool;
use stepwise_core::types::{Prompt, ToolContext, ToolDefinition, ValueMap};
use stepwise_llm::parse_structured;
use stepwise_tools::{execute_tool, validate_args};

use super::{Agent, AgentState, CallerInputMode, ToolErrorPolicy, SUBMIT_RESULT_TOOL};
use crate::calls::{advance, Advance};
use crate::component::Scope;
use crate::status::{Awaiting, ExecutionStatus};
use crate::tokens::compact_tool_output;

/// Why the loop handed control back.
#[derive(Debug)]
pub(crate) enum AgentStop {
    Status(ExecutionStatus),
    /// The LLM called a tool the agent's owner provides. Resolve it with
    /// [`AgentState::complete_call`] and run the loop again.
    Delegate(ToolRequest),
}

/// A server call cleared to run.
struct ReadyCall {
    index: usize,
    tool: Arc<dyn Tool>,
    request: ToolRequest,
    ctx: ToolContext,
}

const SUBMIT_REMINDER: &str =
    "Do not answer in plain text. Call the `submit_result` tool with the final values.";

impl Agent {
    /// The agent loop. `virtual_tools` are offered to the LLM but resolved by
    /// the caller through [`AgentStop::Delegate`].
    pub(crate) async fn run_loop(
        &self,
        state: &mut AgentState,
        mut scope: Scope<'_>,
        virtual_tools: &[ToolDefinition],
    ) -> Result<AgentStop> {
        if state.finished {
            state.finished = false;
            state.iterations = 0;
        }

        loop {
            if !state.pending.is_empty() {
                let resolved = match self.resolve_pending(state, &mut scope, virtual_tools).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        self.close_batch(state, &mut scope)?;
                        return Err(e);
                    }
                };
                if let Some(stop) = resolved {
                    return Ok(stop);
                }
                if let Some(outputs) = state.outputs.take() {
                    return Ok(self.finish(state, outputs));
                }
            }

            if let Some(since) = state.awaiting_user {
                let answered = scope
                    .messages
                    .since(since)
                    .iter()
                    .any(|m| m.message_type == MessageType::User);
                if !answered {
                    return Ok(AgentStop::Status(self.yield_to_user(&scope)));
                }
                state.awaiting_user = None;
                state.iterations = 0;
            }

            scope.ctx.check_interrupts()?;
            if state.iterations >= self.max_iterations {
                if self.caller_input_mode == CallerInputMode::Never {
                    warn!(agent = %self.name, max = self.max_iterations, "Iteration limit reached");
                    return Err(StepwiseError::MaxIterationsExceeded(self.max_iterations));
                }
                info!(agent = %self.name, max = self.max_iterations, "Iteration limit reached, yielding");
                state.awaiting_user = Some(scope.messages.len());
                return Ok(AgentStop::Status(self.yield_to_user(&scope)));
            }
            state.iterations += 1;
            debug!(agent = %self.name, iteration = state.iterations, "Starting agent turn");

            let prompt = self.prompt(state, &scope, virtual_tools).await?;
            let generation = self.llm.generate(prompt, &self.name, scope.ctx).await?;

            if generation.has_tool_requests() {
                debug!(agent = %self.name, calls = generation.tool_requests.len(), "LLM requested tools");
                state.pending = generation
                    .tool_requests
                    .iter()
                    .cloned()
                    .map(crate::calls::PendingCall::new)
                    .collect();
                scope.append(
                    Message::tool_requests(generation.text, generation.tool_requests)
                        .with_sender(&self.name),
                )?;
                continue;
            }

            if let Some(stop) = self.on_text(state, &mut scope, generation.text)? {
                return Ok(stop);
            }
        }
    }

    /// Answer every call of a failed batch so the history stays paired.
    /// Calls that never produced a result are recorded as skipped.
    fn close_batch(&self, state: &mut AgentState, scope: &mut Scope<'_>) -> Result<()> {
        let results = state.abandon_pending();
        debug!(agent = %self.name, calls = results.len(), "Closing failed tool batch");
        for result in results {
            scope.append(Message::tool_result(result))?;
        }
        Ok(())
    }

    fn finish(&self, state: &mut AgentState, outputs: ValueMap) -> AgentStop {
        info!(agent = %self.name, iterations = state.iterations, "Agent finished");
        state.finished = true;
        state.validation_failures = 0;
        AgentStop::Status(ExecutionStatus::finished(outputs))
    }

    fn yield_to_user(&self, scope: &Scope<'_>) -> ExecutionStatus {
        ExecutionStatus::user_message_request(
            scope
                .messages
                .last_of_type(MessageType::Agent)
                .map(|m| m.text()),
        )
    }

    async fn prompt(
        &self,
        state: &AgentState,
        scope: &Scope<'_>,
        virtual_tools: &[ToolDefinition],
    ) -> Result<Prompt> {
        let mut system = scope.ctx.render(&self.system_prompt, &state.inputs)?;
        if !self.outputs.is_empty() && self.caller_input_mode == CallerInputMode::Never {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str("When you are done, call the `submit_result` tool with the final values.");
        }

        let mut messages = scope.messages.healed();
        for transform in &self.transforms {
            messages = transform.apply(messages, scope.ctx).await?;
        }

        let mut tools: Vec<ToolDefinition> = self.tools.iter().map(|t| t.definition()).collect();
        tools.extend(self.submit_result_definition());
        tools.extend(virtual_tools.iter().cloned());

        let mut prompt = Prompt::new(messages).with_tools(tools);
        if !system.is_empty() {
            prompt = prompt.with_system(system);
        }
        Ok(prompt)
    }

    /// Plain assistant text. Returns `Some` when the loop stops here.
    fn on_text(
        &self,
        state: &mut AgentState,
        scope: &mut Scope<'_>,
        text: String,
    ) -> Result<Option<AgentStop>> {
        let parsed = if self.outputs.is_empty() {
            None
        } else {
            parse_structured(&text, &self.outputs).ok()
        };
        scope.append(Message::agent(text).with_sender(&self.name))?;

        match self.caller_input_mode {
            CallerInputMode::Always => {
                state.awaiting_user = Some(scope.messages.len());
                Ok(Some(AgentStop::Status(self.yield_to_user(scope))))
            }
            CallerInputMode::AsNeeded => match parsed {
                Some(outputs) => Ok(Some(self.finish(state, outputs))),
                None => {
                    state.awaiting_user = Some(scope.messages.len());
                    Ok(Some(AgentStop::Status(self.yield_to_user(scope))))
                }
            },
            CallerInputMode::Never => {
                if self.outputs.is_empty() {
                    return Ok(Some(self.finish(state, ValueMap::new())));
                }
                if let Some(outputs) = parsed {
                    return Ok(Some(self.finish(state, outputs)));
                }
                self.validation_failed(state, "answered in plain text instead of calling submit_result")?;
                scope.append(Message::user(SUBMIT_REMINDER).with_sender("stepwise"))?;
                Ok(None)
            }
        }
    }

    fn validation_failed(&self, state: &mut AgentState, message: &str) -> Result<()> {
        state.validation_failures += 1;
        warn!(
            agent = %self.name,
            failures = state.validation_failures,
            max = self.max_validation_retries,
            reason = message,
            "Validation failed"
        );
        if state.validation_failures > self.max_validation_retries {
            return Err(StepwiseError::validation(&self.name, message));
        }
        Ok(())
    }

    fn compact(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(compact_tool_output(&s, self.max_tool_output_tokens)),
            other => {
                let text = other.to_string();
                if text.len() > self.max_tool_output_tokens.saturating_mul(4) {
                    Value::String(compact_tool_output(&text, self.max_tool_output_tokens))
                } else {
                    other
                }
            }
        }
    }

    /// Move every call of the current batch forward in declared order. On
    /// `None` all calls are done and their results have been appended.
    async fn resolve_pending(
        &self,
        state: &mut AgentState,
        scope: &mut Scope<'_>,
        virtual_tools: &[ToolDefinition],
    ) -> Result<Option<AgentStop>> {
        let mut awaiting_client: Vec<ToolRequest> = Vec::new();
        let mut ready: Vec<ReadyCall> = Vec::new();

        for index in 0..state.pending.len() {
            if state.pending[index].is_done() {
                continue;
            }
            let request = state.pending[index].request.clone();

            if request.name == SUBMIT_RESULT_TOOL && !self.outputs.is_empty() {
                let result = match request.args.clone() {
                    Value::Object(map) => coerce_values(&self.outputs, map, &self.name),
                    other => Err(StepwiseError::validation(
                        &self.name,
                        format!("submit_result expects an object, got {}", other),
                    )),
                };
                match result {
                    Ok(outputs) => {
                        debug!(agent = %self.name, "Outputs submitted");
                        state.outputs = Some(outputs);
                        state.pending[index].finish(ToolResult::success(&request.id, Value::String("submitted".into())));
                    }
                    Err(e) => {
                        state.pending[index].finish(ToolResult::error(&request.id, e.to_string()));
                        self.validation_failed(state, &e.to_string())?;
                    }
                }
                continue;
            }

            if virtual_tools.iter().any(|d| d.name == request.name) {
                if !ready.is_empty() {
                    self.run_ready(state, std::mem::take(&mut ready), scope).await?;
                }
                return Ok(Some(AgentStop::Delegate(request)));
            }

            let Some(tool) = self.tool(&request.name).cloned() else {
                let message = format!("unknown tool '{}'", request.name);
                state.pending[index].finish(ToolResult::error(&request.id, &message));
                self.validation_failed(state, &message)?;
                continue;
            };

            if state.pending[index].stage == crate::calls::CallStage::New {
                match validate_args(tool.as_ref(), request.args.clone()) {
                    Ok(args) => state.pending[index].request.args = args,
                    Err(e) => {
                        state.pending[index].finish(ToolResult::error(&request.id, e.to_string()));
                        self.validation_failed(state, &e.to_string())?;
                        continue;
                    }
                }
            }

            match advance(tool.as_ref(), &mut state.pending[index], scope).await? {
                Advance::Suspend(status) => {
                    if !ready.is_empty() {
                        self.run_ready(state, std::mem::take(&mut ready), scope).await?;
                    }
                    return Ok(Some(AgentStop::Status(status)));
                }
                Advance::Client => awaiting_client.push(state.pending[index].request.clone()),
                Advance::Done => {}
                Advance::Ready => {
                    let call = &state.pending[index];
                    let ready_call = ReadyCall {
                        index,
                        ctx: call.tool_context(tool.as_ref(), scope),
                        request: call.request.clone(),
                        tool,
                    };
                    if self.parallel_tool_calls {
                        ready.push(ready_call);
                    } else {
                        self.run_ready(state, vec![ready_call], scope).await?;
                    }
                }
            }
        }

        if !ready.is_empty() {
            self.run_ready(state, ready, scope).await?;
        }

        if !awaiting_client.is_empty() {
            info!(agent = %self.name, calls = awaiting_client.len(), "Awaiting client tool results");
            return Ok(Some(AgentStop::Status(ExecutionStatus::ToolRequest {
                requests: awaiting_client,
                awaiting: Awaiting::Results,
            })));
        }

        for call in std::mem::take(&mut state.pending) {
            let result = call
                .result
                .unwrap_or_else(|| ToolResult::skipped(&call.request.id));
            scope.append(Message::tool_result(result))?;
        }
        Ok(None)
    }

    /// Execute server calls, concurrently when more than one is given.
    async fn run_ready(
        &self,
        state: &mut AgentState,
        calls: Vec<ReadyCall>,
        scope: &Scope<'_>,
    ) -> Result<()> {
        let events = scope.ctx.events();
        let outcomes = join_all(calls.iter().map(|call| {
            execute_tool(
                call.tool.as_ref(),
                &call.request.id,
                call.request.args.clone(),
                call.ctx.clone(),
                Some(events),
            )
        }))
        .await;

        let mut failure = None;
        for (call, outcome) in calls.iter().zip(outcomes) {
            let result = match outcome {
                Ok(value) => ToolResult::success(&call.request.id, self.compact(value)),
                Err(e) => {
                    let result = ToolResult::error(&call.request.id, e.to_string());
                    match self.tool_error_policy {
                        ToolErrorPolicy::Propagate => {
                            warn!(agent = %self.name, tool = %call.request.name, error = %e, "Tool failed");
                            failure.get_or_insert(e);
                        }
                        ToolErrorPolicy::ReportToLlm => {
                            warn!(agent = %self.name, tool = %call.request.name, error = %e, "Reporting tool error to LLM");
                        }
                    }
                    result
                }
            };
            state.pending[call.index].finish(result);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
