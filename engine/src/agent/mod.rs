//! The agent loop.
//!
//! Each turn sends the conversation to the completion port. A reply without
//! tool calls is the final answer. Otherwise every requested call goes
//! through the tool registry, the calls of one turn running concurrently,
//! and their results are appended in the order the model issued them.
//! Everything the loop sees or does is reported as a run event.

use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::core::budget::TurnBudget;
use crate::core::event::EventPayload;
use crate::events::{LogError, WorkflowReporter};
use crate::llm::{Completion, CompletionPort, CompletionRequest, LlmError, Message, Usage};
use crate::tools::{ToolCall, ToolRegistry, ToolResult};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("turn budget exhausted after {turns} turns without a final answer")]
    BudgetExceeded { turns: u32 },
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("failed to record run event: {0}")]
    Log(#[from] LogError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub max_turns: u32,
    /// Overrides the completion port's default model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

/// The message history sent on every turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub system: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![Message::User {
                content: user.into(),
            }],
        }
    }

    fn push_assistant(&mut self, completion: &Completion) {
        self.messages.push(Message::Assistant {
            content: completion.content.clone(),
            tool_calls: completion.tool_calls.clone(),
        });
    }

    fn push_result(&mut self, result: ToolResult) {
        self.messages.push(Message::Tool {
            tool_call_id: result.tool_call_id,
            tool_name: result.tool_name,
            content: result.content,
            is_error: result.is_error,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub final_answer: String,
    pub turns: u32,
    pub tool_calls: usize,
    pub usage: Usage,
}

pub struct Agent<'a> {
    llm: &'a dyn CompletionPort,
    tools: &'a ToolRegistry,
    reporter: &'a WorkflowReporter,
    config: AgentConfig,
}

impl<'a> Agent<'a> {
    pub fn new(
        llm: &'a dyn CompletionPort,
        tools: &'a ToolRegistry,
        reporter: &'a WorkflowReporter,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            reporter,
            config,
        }
    }

    #[instrument(skip_all, fields(run_id = %self.reporter.run_id(), max_turns = self.config.max_turns))]
    pub fn run(&self, system_prompt: &str, user_message: &str) -> Result<AgentOutcome, AgentError> {
        self.reporter.emit(EventPayload::SystemPrompt {
            content: system_prompt.to_string(),
        })?;
        self.reporter.emit(EventPayload::UserMessage {
            content: user_message.to_string(),
        })?;

        let mut conversation = Conversation::new(system_prompt, user_message);
        let mut budget = TurnBudget::new(self.config.max_turns);
        let mut usage = Usage::default();
        let mut tool_calls = 0usize;

        loop {
            let turn = budget.begin_turn().map_err(|exhausted| {
                warn!(max_turns = exhausted.max_turns, "turn budget exhausted");
                AgentError::BudgetExceeded {
                    turns: exhausted.max_turns,
                }
            })?;

            let mut completion = self.complete(&conversation)?;
            if let Some(turn_usage) = completion.usage {
                usage.input_tokens += turn_usage.input_tokens;
                usage.output_tokens += turn_usage.output_tokens;
            }
            assign_missing_ids(&mut completion.tool_calls, turn);
            self.report_completion(&completion)?;

            if completion.tool_calls.is_empty() {
                info!(turns = turn, tool_calls, "agent finished");
                return Ok(AgentOutcome {
                    final_answer: completion.content,
                    turns: turn,
                    tool_calls,
                    usage,
                });
            }

            for call in &completion.tool_calls {
                self.reporter.emit(EventPayload::ToolCall {
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    arguments_json: call.arguments.clone(),
                })?;
            }
            tool_calls += completion.tool_calls.len();

            let results = self.execute_turn(&completion.tool_calls);
            conversation.push_assistant(&completion);
            for result in results {
                self.reporter.emit(EventPayload::ToolCallResult {
                    tool_name: result.tool_name.clone(),
                    tool_call_id: result.tool_call_id.clone(),
                    content: result.content.clone(),
                    is_error: result.is_error,
                })?;
                conversation.push_result(result);
            }
        }
    }

    fn complete(&self, conversation: &Conversation) -> Result<Completion, LlmError> {
        let request = CompletionRequest {
            system: Some(conversation.system.clone()),
            messages: conversation.messages.clone(),
            tools: self.tools.definitions(),
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
        };
        self.llm.create_completion(&request)
    }

    fn report_completion(&self, completion: &Completion) -> Result<(), LogError> {
        if let Some(reasoning) = completion.reasoning.as_deref().filter(|r| !r.is_empty()) {
            self.reporter.emit(EventPayload::Reasoning {
                content: reasoning.to_string(),
            })?;
        }
        if !completion.content.is_empty() || completion.tool_calls.is_empty() {
            self.reporter.emit(EventPayload::LlmResponse {
                content: completion.content.clone(),
                model: Some(completion.model.clone()).filter(|m| !m.is_empty()),
            })?;
        }
        Ok(())
    }

    /// Dispatch one turn's calls concurrently; results come back in issue order.
    fn execute_turn(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        if let [call] = calls {
            return vec![self.tools.dispatch(call)];
        }
        debug!(calls = calls.len(), "dispatching tool calls concurrently");
        let tools = self.tools;
        thread::scope(|scope| {
            let handles: Vec<_> = calls
                .iter()
                .map(|call| (call, scope.spawn(move || tools.dispatch(call))))
                .collect();
            handles
                .into_iter()
                .map(|(call, handle)| {
                    handle.join().unwrap_or_else(|_| ToolResult {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        content: format!("Error: tool '{}' panicked", call.name),
                        is_error: true,
                    })
                })
                .collect()
        })
    }
}

/// Results are matched to calls by id, so every call needs a distinct one.
fn assign_missing_ids(calls: &mut [ToolCall], turn: u32) {
    for (idx, call) in calls.iter_mut().enumerate() {
        if call.id.trim().is_empty() {
            call.id = format!("call_{turn}_{idx}");
        }
    }
}
