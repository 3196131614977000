//! The turn engine: advancing an agent by one conversational turn.
//!
//! [`Store::advance`] is the crate's main verb. One call runs the full
//! state machine:
//!
//! ```text
//!   Start ── validate ──► Load ──► AppendUser ──► LLMCall
//!                                                  │
//!                        ◄── no tool_calls ────────┤
//!                                                  │ has tool_calls AND gateway
//!                                                  ▼
//!                                            FanOutTools ──► AppendTools ─┐
//!                                                  ▲                      │
//!                                                  └── rounds < cap ──────┘
//!                        ◄── rounds == cap ─── Commit ◄── exit loop
//! ```
//!
//! The parent agent is never touched. All assets minted during the turn
//! (user message, assistant messages, tool results, the derived
//! conversation, the evolved agent) are committed together in one
//! transaction at the end; if anything fails before that, nothing new is
//! reachable from the store.
//!
//! Tool calls within one round are dispatched concurrently and their
//! results appended in the assistant's call order, so transcripts are
//! deterministic regardless of tool latency.

use crate::assets::{Agent, Message, ToolCall};
use crate::llm::CompletionParams;
use crate::mcp::ToolGateway;
use crate::store::{CachedAsset, Store};
use crate::{Error, Result};
use futures::future::join_all;
use serde_json::Value;
use std::time::Duration;

/// Per-call options for [`Store::advance`].
///
/// The three model knobs (`temperature`, `max_tokens`, `top_p`) overlay the
/// agent's own `model_config` for this call only; the evolved agent still
/// inherits the unmodified config.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    /// Upper bound on LLM-call/tool-execution rounds in one turn.
    pub max_tool_rounds: u32,

    /// Additional LLM attempts after the first for transient failures.
    pub max_retries: u32,

    /// Wall-clock bound per LLM attempt; `None` disables it.
    pub timeout: Option<Duration>,

    /// Sampling temperature override for this call.
    pub temperature: Option<f64>,

    /// Completion-length override for this call.
    pub max_tokens: Option<u32>,

    /// Nucleus-sampling override for this call.
    pub top_p: Option<f64>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            max_retries: 3,
            timeout: Some(Duration::from_secs(120)),
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }
}

impl TurnOptions {
    /// Options with the defaults above.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tool-round cap.
    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Set the retry budget for transient LLM failures.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable the per-attempt timeout.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Override the sampling temperature for this call.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Override the completion length for this call.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Override nucleus sampling for this call.
    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

impl Store {
    /// Advance `agent` by one turn and return the resulting agent.
    ///
    /// Runs the user message (and any tool ping-pong the model requests)
    /// against the LLM, then commits a new conversation and a new agent
    /// whose `parent_id` is `agent.id`. The input agent is unchanged; two
    /// concurrent `advance` calls on the same agent produce two siblings
    /// with disjoint new messages.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty `user_text`, a zero
    ///   `max_tool_rounds`, or a non-positive timeout
    /// - [`Error::ConversationNotFound`] / [`Error::SystemPromptNotFound`]
    ///   / [`Error::MessageNotFound`] when the agent's references do not
    ///   resolve
    /// - [`Error::Llm`] when the model call fails terminally
    ///
    /// Tool *execution* failures do not abort the turn: they are rendered
    /// as `"Error: ..."` tool results that the model can observe and react
    /// to in the next round.
    pub async fn advance(
        &self,
        agent: &Agent,
        user_text: &str,
        gateway: Option<&dyn ToolGateway>,
        options: &TurnOptions,
    ) -> Result<Agent> {
        if user_text.trim().is_empty() {
            return Err(Error::validation("user_text", "must not be empty"));
        }
        if options.max_tool_rounds < 1 {
            return Err(Error::validation("max_tool_rounds", "must be at least 1"));
        }
        if let Some(timeout) = options.timeout {
            if timeout.is_zero() {
                return Err(Error::validation("timeout", "must be positive"));
            }
        }

        // Effective model config: agent defaults + per-call overrides.
        let mut effective = agent.model_config.clone();
        if let Some(temperature) = options.temperature {
            effective.insert("temperature".into(), Value::from(temperature));
        }
        if let Some(max_tokens) = options.max_tokens {
            effective.insert("max_tokens".into(), Value::from(max_tokens));
        }
        if let Some(top_p) = options.top_p {
            effective.insert("top_p".into(), Value::from(top_p));
        }

        tracing::info!(
            agent = %agent.id,
            name = %agent.name,
            model = %agent.model,
            "advancing agent"
        );

        let conversation = self
            .get_conversation(agent.conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(agent.conversation_id))?;
        let system_prompt = self
            .get_system_prompt(agent.system_prompt_id)
            .await?
            .ok_or(Error::SystemPromptNotFound(agent.system_prompt_id))?;

        let mut transcript = self.get_messages(&conversation.message_ids).await?;
        tracing::debug!(existing = transcript.len(), "loaded conversation history");

        let user_message = Message::user(user_text);
        transcript.push(user_message.clone());
        let mut new_messages: Vec<Message> = vec![user_message];

        let tools: Option<Vec<Value>> = gateway.map(|g| g.all_tools());

        // Tool loop: each round is one LLM call, possibly followed by a
        // concurrent fan-out of the requested tools.
        let mut llm_calls = 0u32;
        for _ in 0..options.max_tool_rounds {
            let assistant = self
                .llm()
                .complete(
                    &transcript,
                    CompletionParams {
                        model: &agent.model,
                        system: &system_prompt.content,
                        tools: tools.as_deref(),
                        max_retries: options.max_retries,
                        timeout: options.timeout,
                        model_config: &effective,
                    },
                )
                .await?;
            llm_calls += 1;

            let calls = assistant.tool_calls.clone().unwrap_or_default();
            transcript.push(assistant.clone());
            new_messages.push(assistant);

            let Some(gateway) = gateway else { break };
            if calls.is_empty() {
                break;
            }

            // Dispatch every call concurrently; join_all yields results in
            // call order, which fixes the transcript order.
            let results = join_all(calls.iter().map(|call| execute_tool_call(gateway, call))).await;
            for result in results {
                let message = result?;
                transcript.push(message.clone());
                new_messages.push(message);
            }
        }

        let new_ids: Vec<_> = new_messages.iter().map(|m| m.id).collect();
        let new_conversation = conversation.with_messages(&new_ids);
        let new_agent = agent.evolve(&new_conversation);

        // Cache first: the cascade save resolves dependencies from the cache.
        for message in &new_messages {
            self.cache_asset(CachedAsset::Message(message.clone()));
        }
        self.cache_asset(CachedAsset::Conversation(new_conversation));
        self.save_agent_cascade(&new_agent).await?;

        tracing::info!(
            old = %agent.id,
            new = %new_agent.id,
            llm_calls,
            new_messages = new_messages.len(),
            "agent advanced"
        );
        Ok(new_agent)
    }
}

/// Run one tool call and shape its outcome as a tool message.
///
/// A [`Error::ToolExecution`] is *data*: the failure text is fed back to
/// the model as the tool result. Anything else aborts the turn.
async fn execute_tool_call(gateway: &dyn ToolGateway, call: &ToolCall) -> Result<Message> {
    let text = match gateway.execute(&call.name, &call.arguments).await {
        Ok(text) => text,
        Err(err @ Error::ToolExecution { .. }) => format!("Error: {err}"),
        Err(other) => return Err(other),
    };
    Ok(Message::tool_result(&call.call_id, text))
}
