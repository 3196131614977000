//! Configuration for the store and the LLM endpoint.
//!
//! Two small config structs with environment-variable support:
//!
//! - [`StoreConfig`]: database DSN and connection-pool sizing
//! - [`LlmConfig`]: chat endpoint, API key, and default model
//!
//! ## Environment Variables
//!
//! | variable | used by | default |
//! |----------|---------|---------|
//! | `VERSIONED_AGENT_DATABASE_URL` | [`StoreConfig::from_env`] | — (required there) |
//! | `VERSIONED_AGENT_BASE_URL` | [`LlmConfig::from_env`] | `http://localhost:1234/v1` |
//! | `VERSIONED_AGENT_API_KEY` | [`LlmConfig::from_env`] | `not-needed` |
//! | `VERSIONED_AGENT_MODEL` | [`LlmConfig::from_env`] | unset |
//!
//! The base-url default targets local OpenAI-compatible servers (LM Studio,
//! Ollama, llama.cpp, vLLM), which typically need no API key.

use crate::{Error, Result};
use std::env;
use std::time::Duration;

/// Database and pool configuration for [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite DSN, e.g. `sqlite:agents.db`.
    pub dsn: String,

    /// Maximum pool connections.
    pub max_connections: u32,

    /// Minimum pool connections kept open.
    pub min_connections: u32,

    /// How long an idle connection may linger before being closed.
    pub idle_timeout: Duration,
}

impl StoreConfig {
    /// Configuration for `dsn` with default pool sizing.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            max_connections: 10,
            min_connections: 2,
            idle_timeout: Duration::from_secs(300),
        }
    }

    /// Read the DSN from `VERSIONED_AGENT_DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match env::var("VERSIONED_AGENT_DATABASE_URL") {
            Ok(dsn) => Ok(Self::new(dsn)),
            Err(_) => Err(Error::validation(
                "VERSIONED_AGENT_DATABASE_URL",
                "environment variable is not set",
            )),
        }
    }

    /// Set the maximum pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the minimum pool size.
    pub fn with_min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the idle-connection lifetime.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Chat endpoint configuration for the default
/// [`HttpChatProvider`](crate::HttpChatProvider).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL, e.g. `http://localhost:1234/v1`.
    pub base_url: String,

    /// Bearer token; local servers accept anything.
    pub api_key: String,

    /// Model to suggest when callers don't name one.
    pub default_model: Option<String>,
}

impl LlmConfig {
    /// Resolve the endpoint from the environment, falling back to a local
    /// OpenAI-compatible server with no auth.
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("VERSIONED_AGENT_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:1234/v1".to_string()),
            api_key: env::var("VERSIONED_AGENT_API_KEY")
                .unwrap_or_else(|_| "not-needed".to_string()),
            default_model: env::var("VERSIONED_AGENT_MODEL").ok(),
        }
    }

    /// Explicit endpoint configuration.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            default_model: None,
        }
    }

    /// Set the default model.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}
