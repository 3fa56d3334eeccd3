use super::directive;
use super::events::{AgentEvent, EventSink};
use crate::application::registry::ToolRegistry;
use crate::domain::types::{ChatMessage, MessageRole};
use crate::infrastructure::model::{ModelError, ModelProvider, ModelRequest};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MAX_TURNS: usize = 32;

/// Prefixes the summary returned when the turn budget runs out, so callers
/// can tell a forced stop from a genuine completion.
pub const MAX_TURNS_MARKER: &str = "[max-turns-reached]";

const REFLECTION_PROMPT: &str = "You have used the maximum number of turns for this task. \
Do not request any more tool calls. Summarize the progress made so far, any issues you ran \
into, and the next steps you would take.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Result of one `chat` call. Cancellation is a sentinel, not an error, so
/// callers can distinguish a user-initiated stop from genuine failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Answer { content: String, turns: usize },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
}

impl AgentOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }
}

/// A growing message history identified by a generated id. Append-only
/// during a turn; the orchestrator seeds the system prompt on first use, so
/// passing the same value back in resumes the conversation.
#[derive(Debug)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// The control loop: calls the model, parses directives, dispatches tool
/// calls through the registry, appends results, and repeats until a final
/// answer, cancellation, or the turn budget.
pub struct Orchestrator<P: ModelProvider> {
    provider: Arc<P>,
    registry: Arc<ToolRegistry>,
    options: AgentOptions,
    events: EventSink,
}

impl<P: ModelProvider> Orchestrator<P> {
    pub fn new(provider: Arc<P>, registry: Arc<ToolRegistry>, options: AgentOptions) -> Self {
        Self {
            provider,
            registry,
            options,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub async fn chat(
        &self,
        conversation: &mut Conversation,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, AgentError> {
        info!(conversation = %conversation.id, "Agent chat started");
        if conversation.messages.is_empty() {
            conversation
                .messages
                .push(ChatMessage::new(MessageRole::System, self.compose_system_prompt()));
        }
        conversation
            .messages
            .push(ChatMessage::new(MessageRole::User, prompt));

        for turn in 1..=self.options.max_turns {
            if cancel.is_cancelled() {
                info!(turn, "Chat cancelled before model call");
                return Ok(ChatOutcome::Cancelled);
            }

            self.events.emit(AgentEvent::Thinking { turn });
            debug!(turn, messages = conversation.messages.len(), "Submitting turn to model");
            let Some(content) = self.call_model(&conversation.messages, cancel).await? else {
                info!(turn, "Chat cancelled during model call");
                return Ok(ChatOutcome::Cancelled);
            };

            let Some(parsed) = directive::parse(&content) else {
                // No directive anywhere in the response: the whole text is
                // the final answer.
                conversation
                    .messages
                    .push(ChatMessage::new(MessageRole::Assistant, content.clone()));
                info!(turn, "Agent returned final response");
                return Ok(ChatOutcome::Answer { content, turns: turn });
            };

            if let Some(thought) = &parsed.thought {
                debug!(thought = %thought, "Agent thought");
                self.events.emit(AgentEvent::Thought {
                    text: thought.clone(),
                });
            }

            if parsed.tool_calls.is_empty() {
                let answer = parsed.thought.unwrap_or_else(|| content.clone());
                conversation
                    .messages
                    .push(ChatMessage::new(MessageRole::Assistant, content));
                info!(turn, "Agent returned final response");
                return Ok(ChatOutcome::Answer {
                    content: answer,
                    turns: turn,
                });
            }

            // Keep the raw assistant turn so the model sees its own directive
            // next round.
            conversation
                .messages
                .push(ChatMessage::new(MessageRole::Assistant, content));

            // Sequential on purpose: call i+1 may depend on side effects of
            // call i.
            for call in &parsed.tool_calls {
                if cancel.is_cancelled() {
                    info!(turn, "Chat cancelled before tool execution");
                    return Ok(ChatOutcome::Cancelled);
                }

                self.events.emit(AgentEvent::ToolStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                info!(tool = %call.name, "Executing tool call");

                match self.registry.execute(call).await {
                    Ok(result) => {
                        let rendered = result.to_string();
                        self.events.emit(AgentEvent::ToolEnd {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            success: true,
                            detail: rendered.clone(),
                        });
                        conversation
                            .messages
                            .push(ChatMessage::new(MessageRole::Tool, rendered));
                    }
                    Err(err) => {
                        // Recovered locally: the model sees the error envelope
                        // and may adapt; the loop continues.
                        warn!(tool = %call.name, %err, "Tool execution failed");
                        self.events.emit(AgentEvent::ToolEnd {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            success: false,
                            detail: err.to_string(),
                        });
                        let envelope = json!({
                            "status": "error",
                            "tool_call_id": call.id,
                            "error": err.to_string(),
                        });
                        conversation
                            .messages
                            .push(ChatMessage::new(MessageRole::Tool, envelope.to_string()));
                    }
                }
            }
        }

        // Budget exhausted: one reflection turn outside the budget, so the
        // caller still gets a useful summary instead of silence.
        warn!(
            max_turns = self.options.max_turns,
            "Turn budget exhausted; requesting progress summary"
        );
        if cancel.is_cancelled() {
            return Ok(ChatOutcome::Cancelled);
        }
        conversation
            .messages
            .push(ChatMessage::new(MessageRole::User, REFLECTION_PROMPT));
        let Some(summary) = self.call_model(&conversation.messages, cancel).await? else {
            // Withdraw the reflection prompt so a cancelled run does not
            // leave a dangling user message in the history.
            conversation.messages.pop();
            return Ok(ChatOutcome::Cancelled);
        };
        conversation
            .messages
            .push(ChatMessage::new(MessageRole::Assistant, summary.clone()));
        Ok(ChatOutcome::Answer {
            content: format!("{MAX_TURNS_MARKER} {summary}"),
            turns: self.options.max_turns,
        })
    }

    /// One model round trip, raced against cancellation. Returns `None` when
    /// the token fires first.
    async fn call_model(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AgentError> {
        let request = ModelRequest {
            model: self.options.model.clone(),
            messages: messages.to_vec(),
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = self.provider.chat(request) => result?,
        };
        if let Some(usage) = response.usage {
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Model reported token usage"
            );
        }
        Ok(Some(response.message.content))
    }

    fn compose_system_prompt(&self) -> String {
        let mut lines = vec![
            "You are an autonomous coding assistant that can call tools to solve user requests."
                .to_string(),
            "To invoke tools, respond with a fenced ```json block containing \
{\"thought\":\"...\",\"tool_calls\":[{\"id\":\"...\",\"name\":\"tool_name\",\"arguments\":{...}}]}."
                .to_string(),
            "Tool calls run in the order you list them; each result is appended to the \
conversation before the next call runs.".to_string(),
            "When you are ready to answer, reply with plain text and no tool_calls.".to_string(),
        ];

        if let Some(custom) = &self.options.system_prompt {
            if !custom.trim().is_empty() {
                lines.push(custom.trim().to_string());
            }
        }

        let descriptors = self.registry.descriptors();
        if descriptors.is_empty() {
            lines.push("No tools are currently available.".to_string());
        } else {
            lines.push("Available tools:".to_string());
            for descriptor in descriptors {
                let compact = serde_json::to_string(&descriptor.schema).unwrap_or_default();
                lines.push(format!(
                    "- {}: {}. Input schema: {}",
                    descriptor.name, descriptor.description, compact
                ));
            }
        }

        lines.join(" ")
    }
}
