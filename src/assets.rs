//! Immutable asset types: system prompts, messages, conversations, agents.
//!
//! Every asset carries a random 128-bit id and a UTC creation instant,
//! stamped at construction. Assets are never mutated after creation; any
//! state change mints a new asset that references its predecessors by id.
//! This is what makes branching and lineage queries cheap: two agents that
//! share history simply reference the same message and prompt ids.
//!
//! Equality and hashing are by id only. Two handles to the same persisted
//! asset compare equal even if one was loaded later.
//!
//! # Asset graph
//!
//! - [`Agent`] references a [`SystemPrompt`], a [`Conversation`], and
//!   optionally a parent `Agent` (the state it evolved from).
//! - [`Conversation`] is an ordered list of [`Message`] ids. Appending
//!   messages produces a *new* conversation whose id sequence is the old
//!   sequence plus the new ids ([`Conversation::with_messages`]).
//! - [`Message`] embeds [`ToolCall`]s when the assistant requested tools.
//!
//! # Example
//!
//! ```
//! use versioned_agent::{Conversation, Message};
//!
//! let conv = Conversation::new();
//! let user = Message::user("Hello");
//! let next = conv.with_messages(&[user.id]);
//!
//! assert!(conv.message_ids.is_empty());
//! assert_eq!(next.message_ids, vec![user.id]);
//! assert_ne!(conv.id, next.id);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Generate a fresh asset id.
pub(crate) fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Current UTC instant, the creation timestamp for new assets.
pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

// ============================================================================
// SYSTEM PROMPT
// ============================================================================

/// An immutable system prompt.
///
/// Referenced by one or more agents via `system_prompt_id`; cloned agents
/// share the same prompt asset rather than copying its content.
#[derive(Debug, Clone)]
pub struct SystemPrompt {
    /// Unique asset id.
    pub id: Uuid,
    /// Creation instant (UTC).
    pub created_at: DateTime<Utc>,
    /// The prompt text sent as the leading system turn of every LLM call.
    pub content: String,
}

impl SystemPrompt {
    /// Create a new system prompt with a fresh id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `content` is empty or whitespace.
    pub fn new(content: impl Into<String>) -> Result<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(Error::validation("system_prompt", "must not be empty"));
        }
        Ok(Self {
            id: new_id(),
            created_at: now_utc(),
            content,
        })
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Who produced a message.
///
/// Serializes to the lowercase strings used on the wire and in storage
/// (`"user"`, `"assistant"`, `"tool"`). There is no `system` role: the
/// system prompt is a separate asset, prepended at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Input from the caller.
    User,
    /// Response from the model, possibly carrying tool-call requests.
    Assistant,
    /// Result of executing one tool call, fed back to the model.
    Tool,
}

impl MessageRole {
    /// Storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    /// Parse the storage representation back into a role.
    pub(crate) fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(Error::validation("role", format!("unknown role '{other}'"))),
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tool call requested by the assistant.
///
/// Embedded in an assistant [`Message`], never persisted on its own.
/// `arguments` is the provider's raw JSON text, preserved byte-exact so
/// that replaying a transcript sends exactly what the model produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque call id assigned by the provider; correlates the tool
    /// result back to this request.
    pub call_id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Raw JSON text of the arguments.
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call record.
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// An immutable message in a conversation.
///
/// The per-role invariants are enforced by the constructors:
///
/// | role | content | tool_calls | tool_call_id | token counts |
/// |------|---------|-----------|--------------|--------------|
/// | user | required | absent | absent | absent |
/// | assistant | required unless tool_calls non-empty | optional | absent | if reported |
/// | tool | required | absent | required | absent |
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique asset id.
    pub id: Uuid,
    /// Creation instant (UTC).
    pub created_at: DateTime<Utc>,
    /// Who produced this message.
    pub role: MessageRole,
    /// Text content; `None` only for assistant messages that are pure
    /// tool-call requests.
    pub content: Option<String>,
    /// Tool calls requested by the assistant, in provider order.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For tool messages, the `call_id` this result answers.
    pub tool_call_id: Option<String>,
    /// Prompt tokens reported by the provider for the call that produced
    /// this assistant message.
    pub input_tokens: Option<u32>,
    /// Completion tokens reported by the provider.
    pub output_tokens: Option<u32>,
}

impl Message {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            created_at: now_utc(),
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// Create an assistant message.
    ///
    /// An empty `tool_calls` vector is normalized to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if there are no tool calls and no
    /// content: an assistant turn must carry at least one of the two.
    pub fn assistant(
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    ) -> Result<Self> {
        let tool_calls = tool_calls.filter(|tc| !tc.is_empty());
        if tool_calls.is_none() && content.is_none() {
            return Err(Error::validation(
                "content",
                "assistant message without tool calls must have content",
            ));
        }
        Ok(Self {
            id: new_id(),
            created_at: now_utc(),
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            input_tokens,
            output_tokens,
        })
    }

    /// Create a tool result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            created_at: now_utc(),
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// Rebuild a message from its persisted parts. Used by the store's
    /// row mapping; does not re-stamp id or timestamp.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: Uuid,
        created_at: DateTime<Utc>,
        role: MessageRole,
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
        tool_call_id: Option<String>,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    ) -> Self {
        Self {
            id,
            created_at,
            role,
            content,
            tool_calls,
            tool_call_id,
            input_tokens,
            output_tokens,
        }
    }
}

// ============================================================================
// CONVERSATION
// ============================================================================

/// An immutable conversation: an ordered sequence of message ids.
///
/// The sequence is the canonical transcript order. Conversations are
/// append-only by derivation: [`with_messages`](Conversation::with_messages)
/// returns a new conversation whose sequence is this one's plus the given
/// ids, so an ancestor's sequence is always a prefix of its descendants'.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Unique asset id.
    pub id: Uuid,
    /// Creation instant (UTC).
    pub created_at: DateTime<Utc>,
    /// Message ids in transcript order.
    pub message_ids: Vec<Uuid>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        Self {
            id: new_id(),
            created_at: now_utc(),
            message_ids: Vec::new(),
        }
    }

    /// Derive a new conversation with `ids` appended.
    pub fn with_messages(&self, ids: &[Uuid]) -> Self {
        let mut message_ids = Vec::with_capacity(self.message_ids.len() + ids.len());
        message_ids.extend_from_slice(&self.message_ids);
        message_ids.extend_from_slice(ids);
        Self {
            id: new_id(),
            created_at: now_utc(),
            message_ids,
        }
    }

    pub(crate) fn from_parts(
        id: Uuid,
        created_at: DateTime<Utc>,
        message_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id,
            created_at,
            message_ids,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// AGENT
// ============================================================================

/// An immutable agent: one conversational state.
///
/// An agent binds together a name, a system prompt, a conversation, a model
/// identifier, free-form metadata, and per-agent model configuration.
/// Advancing the agent ([`Store::advance`](crate::Store::advance)) creates
/// a *new* agent whose `parent_id` is this one's id; the parent chain forms
/// the agent's lineage.
///
/// Agents do not hold a reference to the store they came from; all graph
/// operations (advance, lineage, clone, delete) are [`Store`](crate::Store)
/// methods that take the agent as an argument.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Unique asset id — this is the agent's version identifier.
    pub id: Uuid,
    /// Creation instant (UTC).
    pub created_at: DateTime<Utc>,
    /// Human-readable name; shared by every version of the agent.
    pub name: String,
    /// Id of the [`SystemPrompt`] asset.
    pub system_prompt_id: Uuid,
    /// Id of the agent this one evolved from; `None` for roots.
    pub parent_id: Option<Uuid>,
    /// Id of the [`Conversation`] asset.
    pub conversation_id: Uuid,
    /// Model identifier passed to the LLM provider.
    pub model: String,
    /// Free-form key-value data attached to this agent version.
    pub metadata: Map<String, Value>,
    /// Default LLM options (`temperature`, `max_tokens`, `top_p`, ...)
    /// forwarded verbatim to the provider on every turn.
    pub model_config: Map<String, Value>,
}

impl Agent {
    /// Create a root agent (no parent) over the given prompt and
    /// conversation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `name` or `model` is empty after
    /// trimming.
    pub fn create(
        name: impl Into<String>,
        system_prompt: &SystemPrompt,
        conversation: &Conversation,
        model: impl Into<String>,
        metadata: Option<Map<String, Value>>,
        model_config: Option<Map<String, Value>>,
    ) -> Result<Self> {
        let name = name.into();
        let model = model.into();
        if name.trim().is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }
        if model.trim().is_empty() {
            return Err(Error::validation("model", "must not be empty"));
        }
        Ok(Self {
            id: new_id(),
            created_at: now_utc(),
            name,
            system_prompt_id: system_prompt.id,
            parent_id: None,
            conversation_id: conversation.id,
            model,
            metadata: metadata.unwrap_or_default(),
            model_config: model_config.unwrap_or_default(),
        })
    }

    /// Derive the next agent state over an updated conversation.
    ///
    /// Everything except id, timestamp, `parent_id`, and the conversation
    /// reference is inherited.
    pub(crate) fn evolve(&self, conversation: &Conversation) -> Self {
        Self {
            id: new_id(),
            created_at: now_utc(),
            name: self.name.clone(),
            system_prompt_id: self.system_prompt_id,
            parent_id: Some(self.id),
            conversation_id: conversation.id,
            model: self.model.clone(),
            metadata: self.metadata.clone(),
            model_config: self.model_config.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: Uuid,
        created_at: DateTime<Utc>,
        name: String,
        system_prompt_id: Uuid,
        parent_id: Option<Uuid>,
        conversation_id: Uuid,
        model: String,
        metadata: Map<String, Value>,
        model_config: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            created_at,
            name,
            system_prompt_id,
            parent_id,
            conversation_id,
            model,
            metadata,
            model_config,
        }
    }
}

// ============================================================================
// IDENTITY: EQUALITY AND HASHING BY ID ONLY
// ============================================================================

macro_rules! identity_by_id {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl PartialEq for $ty {
                fn eq(&self, other: &Self) -> bool {
                    self.id == other.id
                }
            }

            impl Eq for $ty {}

            impl Hash for $ty {
                fn hash<H: Hasher>(&self, state: &mut H) {
                    self.id.hash(state);
                }
            }
        )+
    };
}

identity_by_id!(SystemPrompt, Message, Conversation, Agent);
