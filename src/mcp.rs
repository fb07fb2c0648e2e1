//! Line-delimited JSON-RPC 2.0 over stdio exposing the `ask_continue` tool.
//!
//! Every `tools/call` runs on its own task so a call that is waiting on the
//! human does not stall `ping` or a second concurrent call. Responses from all
//! tasks funnel through one writer so lines never interleave.

use anyhow::Context;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};

use crate::{
    reply::{render_outcome, ToolReply},
    service::RelayService,
};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const TOOL_NAME: &str = "ask_continue";
pub const DEFAULT_REASON: &str = "Task completed";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INTERNAL_ERROR: i64 = -32603;

const TOOL_DESCRIPTION: &str = "HIGHEST PRIORITY: ask the user whether to continue the conversation.

Rules, without exception:
1. Call this tool before ending every reply.
2. Call this tool at the very start of a conversation, even for a greeting.
3. Call this tool after completing any task or answering any question.
4. Even when you believe the conversation should end, call this tool and let the user decide.

Never end a reply without calling this tool and never assume the user has no follow-up.
Order: reply -> call ask_continue -> wait for user input -> repeat.";

pub fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": TOOL_DESCRIPTION,
        "inputSchema": {
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Short summary of the work done and why you are asking whether to continue"
                }
            },
            "required": ["reason"]
        }
    })
}

#[derive(Clone)]
pub struct McpServer {
    service: RelayService,
}

impl McpServer {
    pub fn new(service: RelayService) -> Self {
        Self { service }
    }

    /// Serve until `reader` reaches end of input. Calls still waiting on the
    /// human are abandoned at that point; nobody is left to read their reply.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Value>();
        let writer_task = tokio::spawn(write_responses(writer, rx));
        let mut calls = JoinSet::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .context("failed reading stdin")?;
            if read == 0 {
                break;
            }
            while calls.try_join_next().is_some() {}

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(error) => {
                    tracing::warn!(target = "ask_relay::mcp", error = %error, "JSON-RPC line is not UTF-8");
                    let _ = tx.send(error_response(
                        Value::Null,
                        PARSE_ERROR,
                        format!("Parse error: {error}"),
                    ));
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_str(line) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(target = "ask_relay::mcp", error = %error, "unparsable JSON-RPC line");
                    let _ = tx.send(error_response(
                        Value::Null,
                        PARSE_ERROR,
                        format!("Parse error: {error}"),
                    ));
                    continue;
                }
            };

            if message.get("method").and_then(Value::as_str) == Some("tools/call") {
                let server = self.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    if let Some(response) = server.handle_message(message).await {
                        let _ = tx.send(response);
                    }
                });
            } else if let Some(response) = self.handle_message(message).await {
                let _ = tx.send(response);
            }
        }

        tracing::info!(
            target = "ask_relay::mcp",
            outstanding = calls.len(),
            "stdin closed, shutting down tool server"
        );
        calls.shutdown().await;
        drop(tx);
        writer_task.await.context("response writer panicked")??;
        Ok(())
    }

    /// Answer one decoded message. Notifications and unknown notifications
    /// produce no response.
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return id.map(|id| error_response(id, INVALID_REQUEST, "missing method".to_string()));
        };

        let result = match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            "ping" => json!({}),
            "tools/list" => json!({ "tools": [tool_definition()] }),
            "tools/call" => {
                let reply = self.call_tool(message.get("params")).await;
                match serde_json::to_value(reply) {
                    Ok(value) => value,
                    Err(error) => {
                        return id.map(|id| {
                            error_response(id, INTERNAL_ERROR, format!("encode failed: {error}"))
                        });
                    }
                }
            }
            _ if id.is_none() => return None,
            _ => {
                tracing::debug!(target = "ask_relay::mcp", method, "method not found");
                return id.map(|id| {
                    error_response(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
                });
            }
        };

        let id = id?;
        Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    async fn call_tool(&self, params: Option<&Value>) -> ToolReply {
        let name = params
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if name != TOOL_NAME {
            return ToolReply::error(format!("Unknown tool: {name}"));
        }

        let reason = params
            .and_then(|params| params.get("arguments"))
            .and_then(|arguments| arguments.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_REASON);
        tracing::info!(target = "ask_relay::mcp", reason = %reason, "ask_continue called");

        let outcome = self.service.request_user_input(reason).await;
        if let Err(error) = &outcome {
            tracing::warn!(target = "ask_relay::mcp", error = %error, "ask_continue finished without input");
        }
        render_outcome(outcome)
    }
}

fn error_response(id: Value, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Value>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await.context("failed writing stdout")?;
        writer.flush().await.context("failed flushing stdout")?;
    }
    Ok(())
}
