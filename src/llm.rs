//! LLM client: one request/response turn against a chat-completions API.
//!
//! The client is deliberately thin. It translates the in-memory transcript
//! into the provider's wire shape, forwards tool schemas and model options
//! verbatim, retries transient failures with exponential backoff, and maps
//! the response back into an assistant [`Message`] carrying any tool calls
//! and the reported token usage.
//!
//! Provider specifics live behind the [`ChatProvider`] trait.
//! [`HttpChatProvider`] is the production implementation, speaking the
//! OpenAI-compatible `/chat/completions` protocol that local inference
//! servers (LM Studio, Ollama, llama.cpp, vLLM) and most cloud gateways
//! accept. Tests substitute a scripted provider.
//!
//! Streaming is intentionally unsupported: a turn is committed as a whole
//! or not at all, so partial tokens have nothing to attach to.

use crate::assets::{Message, ToolCall};
use crate::retry::{RetryConfig, retry_transient};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// WIRE TYPES (OpenAI-compatible chat completions, non-streaming)
// ============================================================================

/// Request payload for a chat completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier understood by the provider.
    pub model: String,

    /// Transcript in wire order: system turn first, then conversation.
    pub messages: Vec<WireMessage>,

    /// Always false; this client does not consume partial tokens.
    pub stream: bool,

    /// Tool schemas in the provider's function format, when tools are
    /// available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,

    /// Model options (`temperature`, `max_tokens`, `top_p`, and anything
    /// else the provider recognizes), flattened into the request body
    /// verbatim.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// One transcript entry on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// `"system"`, `"user"`, `"assistant"`, or `"tool"`.
    pub role: String,

    /// Text content; null for assistant entries that are pure tool-call
    /// requests.
    pub content: Option<String>,

    /// Tool calls attached to an assistant entry.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<WireToolCall>>,

    /// For tool entries, the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
}

/// A tool call in the provider's format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Provider-assigned call id.
    pub id: String,

    /// Always `"function"` for this protocol.
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,

    /// The function being invoked.
    pub function: WireFunction,
}

fn function_call_type() -> String {
    "function".to_string()
}

/// Function name plus raw JSON argument text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// Raw JSON text, passed through without re-serialization.
    pub arguments: String,
}

/// Response payload from a chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    /// Candidate completions; the first one is used.
    pub choices: Vec<ChatChoice>,

    /// Token accounting, when the provider reports it.
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One candidate completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    /// The assistant's message.
    pub message: ChoiceMessage,

    /// Why generation stopped (`"stop"`, `"tool_calls"`, ...).
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The message inside a choice.
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,

    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let tool_calls = msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.call_id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunction {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect()
        });

        WireMessage {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

// ============================================================================
// PROVIDER SEAM
// ============================================================================

/// One request/response against some chat-completions backend.
///
/// The turn engine only ever talks to this trait, which keeps provider
/// details (auth, base URL, error-class membership) out of the core and
/// lets tests script responses deterministically.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Post one chat request and return the parsed completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion>;
}

/// Production [`ChatProvider`] over an OpenAI-compatible HTTP endpoint.
pub struct HttpChatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpChatProvider {
    /// Create a provider for `base_url` (e.g. `http://localhost:1234/v1`).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Create a provider from an [`LlmConfig`](crate::LlmConfig).
    pub fn from_config(config: &crate::config::LlmConfig) -> Self {
        Self::new(config.base_url.clone(), config.api_key.clone())
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::api(status, body));
        }

        Ok(response.json::<ChatCompletion>().await?)
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Per-call parameters for [`LlmClient::complete`].
#[derive(Clone, Copy)]
pub struct CompletionParams<'a> {
    /// Model identifier.
    pub model: &'a str,

    /// System prompt content, sent as the leading system turn.
    pub system: &'a str,

    /// Tool schemas to advertise, already in function-schema shape.
    pub tools: Option<&'a [Value]>,

    /// Additional attempts after the first for transient failures.
    pub max_retries: u32,

    /// Wall-clock bound per attempt; `None` disables it.
    pub timeout: Option<Duration>,

    /// Model options forwarded verbatim.
    pub model_config: &'a Map<String, Value>,
}

/// The LLM client used by the turn engine.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn ChatProvider>,
}

impl LlmClient {
    /// Create a client over any [`ChatProvider`].
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Run one completion over `transcript` and return the assistant
    /// message.
    ///
    /// Transient failures (network errors, per-attempt timeouts, 5xx, 429)
    /// are retried with exponential backoff up to `max_retries` additional
    /// attempts. Terminal failures surface as [`Error::Llm`].
    pub async fn complete(
        &self,
        transcript: &[Message],
        params: CompletionParams<'_>,
    ) -> Result<Message> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(WireMessage {
            role: "system".to_string(),
            content: Some(params.system.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
        messages.extend(transcript.iter().map(WireMessage::from));

        let tools = params
            .tools
            .filter(|t| !t.is_empty())
            .map(|t| t.to_vec());

        let request = ChatRequest {
            model: params.model.to_string(),
            messages,
            stream: false,
            tools,
            options: params.model_config.clone(),
        };

        tracing::debug!(
            model = params.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "LLM request"
        );
        let started = Instant::now();

        let retry = RetryConfig::default().with_max_attempts(params.max_retries + 1);
        let completion = retry_transient(retry, || async {
            match params.timeout {
                Some(limit) => tokio::time::timeout(limit, self.provider.chat(&request))
                    .await
                    .map_err(|_| Error::timeout())?,
                None => self.provider.chat(&request).await,
            }
        })
        .await
        .map_err(|e| match e {
            Error::Llm(_) => e,
            other => Error::llm(other.to_string()),
        })?;

        let usage = completion.usage;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm("provider returned no choices"))?;

        let tool_calls: Option<Vec<ToolCall>> = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
                .collect()
        });

        let input_tokens = usage.as_ref().and_then(|u| u.prompt_tokens);
        let output_tokens = usage.as_ref().and_then(|u| u.completion_tokens);

        tracing::debug!(
            model = params.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            input_tokens,
            output_tokens,
            tool_calls = tool_calls.as_ref().map_or(0, Vec::len),
            "LLM response"
        );

        Message::assistant(choice.message.content, tool_calls, input_tokens, output_tokens)
            .map_err(|_| Error::llm("provider returned an empty assistant message"))
    }
}
