//! Shared test doubles: a scripted chat provider and an in-process tool
//! gateway.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use versioned_agent::{
    ChatChoice, ChatCompletion, ChatProvider, ChatRequest, ChoiceMessage, Error, Result,
    ToolGateway, Usage, WireFunction, WireToolCall,
};

/// A [`ChatProvider`] that pops pre-scripted completions and records every
/// request it receives.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatCompletion>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ChatCompletion>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers every call with the same text.
    pub fn always_text(text: &str, count: usize) -> Self {
        Self::new((0..count).map(|_| Ok(text_completion(text))).collect())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::llm("scripted provider ran out of responses")))
    }
}

/// A plain-text assistant completion with fixed token usage.
pub fn text_completion(text: &str) -> ChatCompletion {
    ChatCompletion {
        choices: vec![ChatChoice {
            message: ChoiceMessage {
                content: Some(text.to_string()),
                tool_calls: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
        }),
    }
}

/// A completion that requests the given `(call_id, tool, raw_json_args)`
/// calls in order.
pub fn tool_call_completion(calls: &[(&str, &str, &str)]) -> ChatCompletion {
    ChatCompletion {
        choices: vec![ChatChoice {
            message: ChoiceMessage {
                content: None,
                tool_calls: Some(
                    calls
                        .iter()
                        .map(|(id, name, args)| WireToolCall {
                            id: id.to_string(),
                            call_type: "function".to_string(),
                            function: WireFunction {
                                name: name.to_string(),
                                arguments: args.to_string(),
                            },
                        })
                        .collect(),
                ),
            },
            finish_reason: Some("tool_calls".to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
        }),
    }
}

/// In-process [`ToolGateway`] with three fixed tools:
///
/// - `echo` returns its `s` argument verbatim
/// - `slow` sleeps 100ms, then returns its `tag` argument
/// - `boom` always fails with a tool-execution error
pub struct MockGateway;

#[async_trait]
impl ToolGateway for MockGateway {
    fn all_tools(&self) -> Vec<Value> {
        ["echo", "slow", "boom"]
            .iter()
            .map(|name| {
                json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": "",
                        "parameters": {"type": "object", "properties": {}}
                    }
                })
            })
            .collect()
    }

    async fn execute(&self, name: &str, arguments: &str) -> Result<String> {
        let args: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| Error::tool_execution(name, e.to_string()))?
        };

        match name {
            "echo" => Ok(args["s"].as_str().unwrap_or_default().to_string()),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(args["tag"].as_str().unwrap_or_default().to_string())
            }
            "boom" => Err(Error::tool_execution("boom", "synthetic failure")),
            other => Ok(format!("Error: Unknown tool '{other}'")),
        }
    }
}
