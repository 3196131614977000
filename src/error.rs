//! Error types for the versioned-agent crate

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input at an API boundary; never retried
    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Referenced agent does not exist in cache or storage
    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    /// Referenced conversation does not exist in cache or storage
    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    /// Referenced system prompt does not exist in cache or storage
    #[error("System prompt {0} not found")]
    SystemPromptNotFound(Uuid),

    /// Referenced message does not exist in cache or storage
    #[error("Message {0} not found")]
    MessageNotFound(Uuid),

    /// LLM call failed after exhausting retries (or immediately for
    /// non-transient failures)
    #[error("LLM call failed: {0}")]
    Llm(String),

    /// MCP tool execution failed at the protocol or transport level
    #[error("Tool '{tool_name}' failed: {reason}")]
    ToolExecution { tool_name: String, reason: String },

    /// API error from the model server (status + body)
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// MCP server lifecycle failure (spawn, handshake, tool listing)
    #[error("MCP server '{server}' error: {reason}")]
    Mcp { server: String, reason: String },

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Stored data could not be decoded back into an asset
    #[error("Decode error: {0}")]
    Decode(String),

    /// Per-attempt timeout elapsed
    #[error("Request timeout")]
    Timeout,
}

impl Error {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a new LLM error
    pub fn llm(msg: impl Into<String>) -> Self {
        Error::Llm(msg.into())
    }

    /// Create a new tool execution error
    pub fn tool_execution(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ToolExecution {
            tool_name: tool_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new API error
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Error::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a new MCP server error
    pub fn mcp(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Mcp {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }
}
