//! # versioned-agent
//!
//! A library for building and running *immutable* conversational agents.
//!
//! ## Overview
//!
//! An agent here is a persistent value: its system prompt, message history,
//! model identity, metadata, and model configuration are pinned under one
//! version id. Advancing the agent by a turn never mutates it — it produces
//! a **new** agent that links back to the previous one via `parent_id`.
//! Over time your agents form a directed acyclic graph you can branch,
//! query, and garbage-collect:
//!
//! ```text
//!   A1 ──► A2 ──► A3          (advance, advance)
//!          │
//!          └──► A2' ──► ...   (clone, then advance differently)
//! ```
//!
//! ## Key Features
//!
//! - **Immutable lineage**: every turn is a new agent; full history is
//!   always reachable through `parent_id`
//! - **Durable by default**: assets persist to SQLite in transactional
//!   batches; an agent is never visible without its dependencies
//! - **Tool calling over MCP**: child-process tool servers, concurrent
//!   fan-out, failures fed back to the model as data
//! - **Branching**: clone an agent and advance both copies independently;
//!   shared history is stored once
//! - **Garbage collection**: delete agents freely, then sweep unreachable
//!   prompts, conversations, and messages
//! - **Retry logic**: exponential backoff with jitter for transient LLM
//!   failures
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use versioned_agent::{AgentSpec, Store, TurnOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::connect("sqlite:agents.db").await?;
//!
//!     let agent = store
//!         .create_agent(AgentSpec::new(
//!             "Calculator",
//!             "You are a calculator.",
//!             "qwen2.5-32b-instruct",
//!         ))
//!         .await?;
//!
//!     // Each turn returns a new agent; the old one is untouched.
//!     let agent = store
//!         .advance(&agent, "What is 2 + 2?", None, &TurnOptions::default())
//!         .await?;
//!
//!     for message in store.messages(&agent).await? {
//!         println!("{}: {}", message.role, message.content.unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## With tool servers
//!
//! ```rust,no_run
//! use versioned_agent::{AgentSpec, McpGateway, Store, TurnOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::connect("sqlite:agents.db").await?;
//! let agent = store
//!     .create_agent(AgentSpec::new("Forecaster", "You report weather.", "gpt-4o-mini"))
//!     .await?;
//!
//! let mut mcp = McpGateway::new();
//! mcp.connect("weather", "python", &["weather_server.py"], None, None)
//!     .await?;
//!
//! let agent = store
//!     .advance(&agent, "Weather in Paris?", Some(&mcp), &TurnOptions::default())
//!     .await?;
//!
//! mcp.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **assets**: the immutable value types and their invariants
//! - **store**: cache + SQLite persistence, lineage, branching, gc
//! - **turn**: the advancement state machine (LLM calls + tool fan-out)
//! - **llm**: one-shot chat completions behind the [`ChatProvider`] seam
//! - **mcp**: MCP tool-server lifecycle behind the [`ToolGateway`] seam
//! - **retry**: exponential backoff for transient failures
//! - **config**: DSN, pool sizing, endpoint resolution
//! - **error**: the crate-wide error taxonomy

/// The immutable value types: system prompts, messages, conversations,
/// agents, and their constructors/invariants.
mod assets;

/// Configuration for the store (DSN, pool sizing) and the LLM endpoint,
/// with environment-variable resolution.
mod config;

/// Error types and conversions used across all public APIs.
mod error;

/// Chat-completion client: wire types, the `ChatProvider` seam, retries,
/// timeout, and token accounting.
mod llm;

/// MCP tool gateway: child-process server lifecycle, tool indexing, and
/// concurrent execution.
mod mcp;

/// The store: asset cache, SQLite persistence, cascade saves, lineage and
/// pagination queries, garbage collection.
mod store;

/// The turn engine: `Store::advance` and its options.
mod turn;

/// Retry utilities with exponential backoff and jitter.
/// Public so callers can reuse the policy for their own operations.
pub mod retry;

// --- Core types ---

pub use assets::{Agent, Conversation, Message, MessageRole, SystemPrompt, ToolCall};

// --- Store API ---

pub use store::{AgentSpec, GcCounts, Store, TokenUsage};

// --- Turn engine ---

pub use turn::TurnOptions;

// --- LLM client ---

pub use llm::{
    ChatChoice, ChatCompletion, ChatProvider, ChatRequest, ChoiceMessage, CompletionParams,
    HttpChatProvider, LlmClient, Usage, WireFunction, WireMessage, WireToolCall,
};

// --- Tool gateway ---

pub use mcp::{McpGateway, ToolGateway};

// --- Configuration ---

pub use config::{LlmConfig, StoreConfig};

// --- Error handling ---

pub use error::{Error, Result};

/// Convenience module with the most commonly used types.
/// Import with `use versioned_agent::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Agent, AgentSpec, ChatProvider, Conversation, Error, McpGateway, Message, MessageRole,
        Result, Store, SystemPrompt, ToolCall, ToolGateway, TurnOptions,
    };
}
