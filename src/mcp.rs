//! Tool gateway: lifecycle and dispatch for MCP tool servers.
//!
//! Each tool server is a child process speaking the Model Context Protocol
//! over stdio. [`McpGateway`] owns those processes: `connect` spawns one,
//! performs the handshake, lists its tools, and indexes them into a flat
//! `tool name → server` map; `execute` routes a call to the right server;
//! `close` tears everything down in reverse connection order.
//!
//! The turn engine consumes tools through the [`ToolGateway`] trait, so
//! tests can substitute an in-process mock with no child processes at all.
//!
//! Call semantics the engine relies on:
//!
//! - an *unknown tool name* is not an error — `execute` returns a string
//!   starting with `"Error:"` that the engine feeds back to the model;
//! - a *protocol or transport failure* is [`Error::ToolExecution`];
//! - requests to one server are serialized (one in-flight call per stdio
//!   pipe) while different servers run in parallel.

use crate::{Error, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation};
use rmcp::service::RunningService;
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

/// The seam between the turn engine and tool execution.
///
/// [`McpGateway`] is the production implementation; tests provide mocks.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Snapshot of every indexed tool schema, in the provider's
    /// function-schema shape.
    fn all_tools(&self) -> Vec<Value>;

    /// Execute a tool by name with raw JSON argument text.
    ///
    /// An empty argument string is treated as `{}`. Unknown tools return
    /// an `"Error: ..."` string rather than failing.
    async fn execute(&self, name: &str, arguments: &str) -> Result<String>;
}

/// One connected tool server.
struct ServerConnection {
    key: String,
    service: RunningService<RoleClient, ClientInfo>,
    /// One in-flight request per stdio pipe.
    gate: tokio::sync::Mutex<()>,
}

/// Manages connections to multiple MCP tool servers.
///
/// Opening the gateway acquires nothing; every child process is started by
/// [`connect`](McpGateway::connect) and released by
/// [`close`](McpGateway::close). Dropping the gateway without closing still
/// reaps the children: the child-process transport kills its child when
/// dropped.
///
/// When two servers expose the same tool name, the later connection wins
/// and the earlier tool becomes unreachable.
///
/// ```rust,no_run
/// # async fn example() -> versioned_agent::Result<()> {
/// use versioned_agent::McpGateway;
///
/// let mut mcp = McpGateway::new();
/// mcp.connect("weather", "python", &["weather_server.py"], None, None)
///     .await?;
/// let tools = mcp.all_tools();
/// // ... run turns ...
/// mcp.close().await;
/// # Ok(())
/// # }
/// ```
pub struct McpGateway {
    connections: Vec<ServerConnection>,
    /// tool name → (server key, function schema)
    tools: HashMap<String, (String, Value)>,
}

impl McpGateway {
    /// Create a gateway with no connected servers.
    pub fn new() -> Self {
        Self {
            connections: Vec::new(),
            tools: HashMap::new(),
        }
    }

    /// Launch a tool server and index its tools.
    ///
    /// `key` identifies the server within this gateway; `command`, `args`,
    /// `env`, and `cwd` describe the child process. The child's stderr is
    /// inherited so server-side diagnostics stay visible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mcp`] if the process cannot be spawned or the
    /// handshake or tool listing fails.
    pub async fn connect(
        &mut self,
        key: impl Into<String>,
        command: &str,
        args: &[&str],
        env: Option<&HashMap<String, String>>,
        cwd: Option<&Path>,
    ) -> Result<()> {
        let key = key.into();

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(env) = env {
            cmd.envs(env);
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| Error::mcp(&key, format!("failed to spawn '{command}': {e}")))?;

        let client_info = ClientInfo::new(ClientCapabilities::default(), Implementation::from_build_env());
        let service = client_info
            .serve(transport)
            .await
            .map_err(|e| Error::mcp(&key, format!("handshake failed: {e}")))?;

        let listed = service
            .list_all_tools()
            .await
            .map_err(|e| Error::mcp(&key, format!("tool listing failed: {e}")))?;

        let mut names = Vec::with_capacity(listed.len());
        for tool in &listed {
            let tool_json = serde_json::to_value(tool)?;
            let Some(name) = tool_json.get("name").and_then(Value::as_str) else {
                continue;
            };
            // Later connections win on duplicate names.
            self.tools
                .insert(name.to_string(), (key.clone(), function_schema(&tool_json)));
            names.push(name.to_string());
        }

        tracing::debug!(server = %key, tools = names.len(), ?names, "MCP connected");

        self.connections.push(ServerConnection {
            key,
            service,
            gate: tokio::sync::Mutex::new(()),
        });
        Ok(())
    }

    /// Shut down every server in reverse order of connection.
    ///
    /// Failures to stop one server are logged and do not prevent the rest
    /// from being released.
    pub async fn close(&mut self) {
        while let Some(conn) = self.connections.pop() {
            if let Err(e) = conn.service.cancel().await {
                tracing::warn!(server = %conn.key, error = %e, "MCP shutdown failed");
            }
        }
        self.tools.clear();
    }

    fn connection(&self, key: &str) -> Option<&ServerConnection> {
        self.connections.iter().find(|c| c.key == key)
    }
}

impl Default for McpGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolGateway for McpGateway {
    fn all_tools(&self) -> Vec<Value> {
        self.tools.values().map(|(_, schema)| schema.clone()).collect()
    }

    async fn execute(&self, name: &str, arguments: &str) -> Result<String> {
        let Some((server_key, _)) = self.tools.get(name) else {
            tracing::warn!(tool = name, "MCP unknown tool");
            return Ok(format!("Error: Unknown tool '{name}'"));
        };

        let conn = self
            .connection(server_key)
            .ok_or_else(|| Error::tool_execution(name, format!("server '{server_key}' is gone")))?;

        let args: Map<String, Value> = if arguments.trim().is_empty() {
            Map::new()
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| Error::tool_execution(name, format!("invalid arguments JSON: {e}")))?
        };

        tracing::debug!(tool = name, server = %conn.key, "MCP execute");
        let started = Instant::now();

        let result = {
            let _pipe = conn.gate.lock().await;
            conn.service
                .call_tool(CallToolRequestParam::new(name.to_string()).with_arguments(args))
                .await
                .map_err(|e| Error::tool_execution(name, e.to_string()))?
        };

        let result_json = serde_json::to_value(&result)
            .map_err(|e| Error::tool_execution(name, format!("unserializable result: {e}")))?;
        let text = render_content(&result_json);

        tracing::debug!(
            tool = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            result_len = text.len(),
            "MCP result"
        );
        Ok(text)
    }
}

/// Convert one listed MCP tool (in its serialized form) into the
/// provider's function-schema shape.
fn function_schema(tool_json: &Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool_json.get("name").cloned().unwrap_or_default(),
            "description": tool_json.get("description").cloned().unwrap_or(json!("")),
            "parameters": tool_json
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        }
    })
}

/// Concatenate a call result's textual content items with `'\n'`,
/// serializing non-text items as JSON.
fn render_content(result_json: &Value) -> String {
    let Some(items) = result_json.get("content").and_then(Value::as_array) else {
        return String::new();
    };

    let mut texts = Vec::with_capacity(items.len());
    for item in items {
        match item.get("text").and_then(Value::as_str) {
            Some(text) => texts.push(text.to_string()),
            None => texts.push(item.to_string()),
        }
    }
    texts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_schema_conversion() {
        let tool = json!({
            "name": "get_weather",
            "description": "Current weather for a city",
            "inputSchema": {
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }
        });

        let schema = function_schema(&tool);
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "get_weather");
        assert_eq!(schema["function"]["description"], "Current weather for a city");
        assert_eq!(schema["function"]["parameters"]["required"][0], "city");
    }

    #[test]
    fn test_function_schema_defaults() {
        // A tool with no description and no schema still produces a
        // well-formed function entry.
        let tool = json!({"name": "ping"});
        let schema = function_schema(&tool);
        assert_eq!(schema["function"]["name"], "ping");
        assert_eq!(schema["function"]["description"], "");
        assert_eq!(schema["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_render_content_concatenates_text() {
        let result = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"},
            ]
        });
        assert_eq!(render_content(&result), "line one\nline two");
    }

    #[test]
    fn test_render_content_serializes_non_text() {
        let result = json!({
            "content": [
                {"type": "text", "text": "ok"},
                {"type": "resource", "resource": {"uri": "file:///x"}},
            ]
        });
        let rendered = render_content(&result);
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("ok"));
        // Non-text items come back as their JSON serialization.
        let second: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(second["type"], "resource");
    }

    #[test]
    fn test_render_content_empty() {
        assert_eq!(render_content(&json!({"content": []})), "");
        assert_eq!(render_content(&json!({})), "");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_data_not_error() {
        let gateway = McpGateway::new();
        let out = gateway.execute("nope", "").await.unwrap();
        assert_eq!(out, "Error: Unknown tool 'nope'");
    }

    #[test]
    fn test_all_tools_snapshot_empty() {
        let gateway = McpGateway::new();
        assert!(gateway.all_tools().is_empty());
    }
}
