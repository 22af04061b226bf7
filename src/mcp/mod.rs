//! MCP side-channel session - executes cloud-management tools.
//!
//! The tool backend is an MCP server running as a child process (a dockerized
//! cloud CLI by default), spoken to over newline-delimited JSON-RPC 2.0 on
//! stdio. One session is shared by every conversation; an internal mutex
//! serializes requests because the transport carries no reentrancy guarantee.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{CloudCredentials, Config};
use crate::llm::ToolSpec;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool_session_spawn: {0}")]
    Spawn(String),

    #[error("tool_session_io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tool_timeout: no response within {0:?}")]
    Timeout(Duration),

    #[error("tool_protocol: {0}")]
    Protocol(String),

    #[error("tool_failed: {0}")]
    Execution(String),

    #[error("cloud_credentials: {0}")]
    Credentials(String),
}

/// Executes a single named tool call against the external capability session.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, input: &Value) -> Result<String, ToolError>;
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct McpIo {
    writer: BoxedWriter,
    reader: BoxedReader,
    next_id: u64,
}

/// A live MCP session over a child process's stdio.
pub struct McpSession {
    io: Mutex<McpIo>,
    tools: Vec<ToolSpec>,
    request_timeout: Duration,
    // Held so the server process lives as long as the session.
    _child: Option<Child>,
}

impl McpSession {
    /// Spawn the configured MCP server process and complete the protocol
    /// handshake, caching the advertised tool catalog.
    pub async fn connect(config: &Config) -> Result<Self, ToolError> {
        let credentials = assemble_credentials(&config.credentials)?;

        let mut parts = config.mcp_command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ToolError::Spawn("empty MCP_COMMAND".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .env("AZURE_CREDENTIALS", credentials)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn(format!("{}: {}", config.mcp_command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Spawn("child stdout unavailable".to_string()))?;

        let mut session = Self {
            io: Mutex::new(McpIo {
                writer: Box::new(stdin),
                reader: BufReader::new(Box::new(stdout)),
                next_id: 0,
            }),
            tools: Vec::new(),
            request_timeout: config.tool_timeout,
            _child: Some(child),
        };
        session.handshake().await?;

        tracing::info!(
            tools = session.tools.len(),
            "MCP session established with {}",
            config.mcp_command
        );
        Ok(session)
    }

    /// Build a session over an arbitrary transport. Used by tests.
    #[cfg(test)]
    fn from_io(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        request_timeout: Duration,
    ) -> Self {
        Self {
            io: Mutex::new(McpIo {
                writer: Box::new(writer),
                reader: BufReader::new(Box::new(reader)),
                next_id: 0,
            }),
            tools: Vec::new(),
            request_timeout,
            _child: None,
        }
    }

    async fn handshake(&mut self) -> Result<(), ToolError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await?;

        let listing = self.request("tools/list", json!({})).await?;
        let decoded: ToolListing = serde_json::from_value(listing)
            .map_err(|e| ToolError::Protocol(format!("bad tools/list result: {}", e)))?;
        self.tools = decoded
            .tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            })
            .collect();
        Ok(())
    }

    /// The tool catalog advertised by the server at connect time.
    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// One JSON-RPC request/response exchange. Requests are serialized by the
    /// io mutex; interleaved server notifications and stale responses are
    /// skipped by id.
    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let mut io = self.io.lock().await;
        io.next_id += 1;
        let id = io.next_id;

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let exchange = async {
            let mut line = serde_json::to_string(&frame)
                .map_err(|e| ToolError::Protocol(e.to_string()))?;
            line.push('\n');
            io.writer.write_all(line.as_bytes()).await?;
            io.writer.flush().await?;

            loop {
                let mut raw = String::new();
                let n = io.reader.read_line(&mut raw).await?;
                if n == 0 {
                    return Err(ToolError::Protocol(
                        "server closed the connection".to_string(),
                    ));
                }
                let message: Value = match serde_json::from_str(raw.trim()) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if message.get("id").and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                if let Some(err) = message.get("error") {
                    let detail = err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown server error");
                    return Err(ToolError::Protocol(format!("{}: {}", method, detail)));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ToolError::Timeout(self.request_timeout))?
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ToolError> {
        let mut io = self.io.lock().await;
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        let mut line =
            serde_json::to_string(&frame).map_err(|e| ToolError::Protocol(e.to_string()))?;
        line.push('\n');
        io.writer.write_all(line.as_bytes()).await?;
        io.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ToolInvoker for McpSession {
    async fn invoke(&self, name: &str, input: &Value) -> Result<String, ToolError> {
        tracing::info!(tool = name, "invoking tool");
        let result = self
            .request("tools/call", json!({"name": name, "arguments": input}))
            .await?;

        let decoded: CallResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Protocol(format!("bad tools/call result: {}", e)))?;
        let text = decoded
            .content
            .iter()
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if decoded.is_error {
            return Err(ToolError::Execution(text));
        }
        Ok(text)
    }
}

// ── Wire shapes ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct ToolListing {
    #[serde(default)]
    tools: Vec<ToolDecl>,
}

#[derive(Deserialize)]
struct ToolDecl {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
}

#[derive(Deserialize)]
struct CallResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    is_error: bool,
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(default)]
    text: Option<String>,
}

// ── Credentials ───────────────────────────────────────────────────

/// Build the credentials document handed to the server process: either the
/// whole JSON blob from the environment, or assembled from the individual
/// service-principal variables.
fn assemble_credentials(creds: &CloudCredentials) -> Result<String, ToolError> {
    if let Some(blob) = &creds.credentials_json {
        return Ok(blob.clone());
    }

    match (
        &creds.client_id,
        &creds.client_secret,
        &creds.subscription_id,
        &creds.tenant_id,
    ) {
        (Some(client_id), Some(client_secret), Some(subscription_id), Some(tenant_id)) => {
            let document = json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "subscriptionId": subscription_id,
                "tenantId": tenant_id,
                "activeDirectoryEndpointUrl": "https://login.microsoftonline.com",
                "resourceManagerEndpointUrl": "https://management.azure.com/",
                "activeDirectoryGraphResourceId": "https://graph.windows.net/",
                "sqlManagementEndpointUrl": "https://management.core.windows.net:8443/",
                "galleryEndpointUrl": "https://gallery.azure.com/",
                "managementEndpointUrl": "https://management.core.windows.net/",
            });
            Ok(document.to_string())
        }
        _ => Err(ToolError::Credentials(
            "set AZURE_CREDENTIALS or all of AZURE_CLIENT_ID, AZURE_CLIENT_SECRET, \
             AZURE_SUBSCRIPTION_ID, AZURE_TENANT_ID"
                .to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    /// Scripted MCP server speaking over an in-memory duplex pipe.
    async fn run_fake_server(transport: tokio::io::DuplexStream) {
        let (read_half, mut write_half) = split(transport);
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let frame: Value = serde_json::from_str(&line).unwrap();
            let method = frame["method"].as_str().unwrap_or_default();
            let id = frame.get("id").cloned();

            let result = match method {
                "initialize" => json!({"protocolVersion": PROTOCOL_VERSION}),
                "notifications/initialized" => continue,
                "tools/list" => json!({
                    "tools": [{
                        "name": "run_cli",
                        "description": "Run a cloud CLI command",
                        "inputSchema": {"type": "object"}
                    }]
                }),
                "tools/call" => {
                    let command = frame["params"]["arguments"]["command"]
                        .as_str()
                        .unwrap_or_default();
                    if command == "boom" {
                        json!({
                            "content": [{"type": "text", "text": "command failed"}],
                            "isError": true
                        })
                    } else {
                        // Unsolicited notification in front of the response;
                        // the client must skip it.
                        let noise = json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/message",
                            "params": {"level": "info", "data": "working"}
                        });
                        let mut line = noise.to_string();
                        line.push('\n');
                        write_half.write_all(line.as_bytes()).await.unwrap();

                        json!({
                            "content": [
                                {"type": "text", "text": "ran: "},
                                {"type": "text", "text": command}
                            ],
                            "isError": false
                        })
                    }
                }
                other => panic!("unexpected method: {}", other),
            };

            let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
            let mut line = response.to_string();
            line.push('\n');
            write_half.write_all(line.as_bytes()).await.unwrap();
        }
    }

    async fn connected_session() -> McpSession {
        let (client_side, server_side) = duplex(64 * 1024);
        tokio::spawn(run_fake_server(server_side));

        let (read_half, write_half) = split(client_side);
        let mut session =
            McpSession::from_io(read_half, write_half, Duration::from_secs(5));
        session.handshake().await.unwrap();
        session
    }

    #[tokio::test]
    async fn handshake_caches_tool_catalog() {
        let session = connected_session().await;
        assert_eq!(session.tools().len(), 1);
        assert_eq!(session.tools()[0].name, "run_cli");
        assert_eq!(session.tools()[0].description, "Run a cloud CLI command");
    }

    #[tokio::test]
    async fn invoke_concatenates_text_items_and_skips_notifications() {
        let session = connected_session().await;
        let output = session
            .invoke("run_cli", &json!({"command": "group list"}))
            .await
            .unwrap();
        assert_eq!(output, "ran: group list");
    }

    #[tokio::test]
    async fn server_reported_failure_becomes_execution_error() {
        let session = connected_session().await;
        let err = session
            .invoke("run_cli", &json!({"command": "boom"}))
            .await
            .unwrap_err();
        match err {
            ToolError::Execution(text) => assert_eq!(text, "command failed"),
            other => panic!("expected Execution error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let (client_side, _server_side) = duplex(1024);
        let (read_half, write_half) = split(client_side);
        let session =
            McpSession::from_io(read_half, write_half, Duration::from_millis(50));

        let err = session
            .invoke("run_cli", &json!({"command": "slow"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[test]
    fn credentials_prefer_whole_document() {
        let creds = CloudCredentials {
            credentials_json: Some("{\"clientId\":\"abc\"}".to_string()),
            client_id: Some("ignored".to_string()),
            client_secret: None,
            subscription_id: None,
            tenant_id: None,
        };
        assert_eq!(
            assemble_credentials(&creds).unwrap(),
            "{\"clientId\":\"abc\"}"
        );
    }

    #[test]
    fn credentials_assemble_from_parts() {
        let creds = CloudCredentials {
            credentials_json: None,
            client_id: Some("cid".to_string()),
            client_secret: Some("secret".to_string()),
            subscription_id: Some("sub".to_string()),
            tenant_id: Some("tenant".to_string()),
        };
        let document: Value =
            serde_json::from_str(&assemble_credentials(&creds).unwrap()).unwrap();
        assert_eq!(document["clientId"], "cid");
        assert_eq!(document["tenantId"], "tenant");
        assert_eq!(
            document["activeDirectoryEndpointUrl"],
            "https://login.microsoftonline.com"
        );
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let creds = CloudCredentials {
            credentials_json: None,
            client_id: Some("cid".to_string()),
            client_secret: None,
            subscription_id: None,
            tenant_id: None,
        };
        assert!(matches!(
            assemble_credentials(&creds),
            Err(ToolError::Credentials(_))
        ));
    }
}
