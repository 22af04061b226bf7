//! Anthropic Messages API gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{
    ContentBlock, ConversationTurn, GatewayError, ModelGateway, ModelResponse, ToolSpec,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Stateless client for the Anthropic Messages API.
///
/// Every call is one POST with a bounded timeout. Errors carry a structured
/// code in their display form; raw upstream bodies only reach the log sink.
pub struct AnthropicGateway {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicGateway {
    pub fn new(api_key: String, model: String, max_tokens: u32, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            model,
            max_tokens,
        }
    }
}

#[async_trait]
impl ModelGateway for AnthropicGateway {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, GatewayError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: turns.iter().map(ApiMessage::from).collect(),
            tools,
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), %detail, "model request rejected");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                detail: summarize_error_body(&detail),
            });
        }

        let decoded: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        tracing::debug!(
            blocks = decoded.content.len(),
            stop_reason = ?decoded.stop_reason,
            "model response received"
        );

        Ok(ModelResponse {
            content: decoded.content,
            stop_reason: decoded.stop_reason,
        })
    }
}

/// Pull the upstream error message out of the response body, falling back to
/// a generic note so raw payloads never reach the caller.
fn summarize_error_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "upstream rejected the request".to_string())
}

// ── Wire types ────────────────────────────────────────────────────

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    tools: &'a [ToolSpec],
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiBlock>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl From<&ConversationTurn> for ApiMessage {
    fn from(turn: &ConversationTurn) -> Self {
        match turn {
            ConversationTurn::User { text } => ApiMessage {
                role: "user",
                content: ApiContent::Text(text.clone()),
            },
            ConversationTurn::Assistant { content } => ApiMessage {
                role: "assistant",
                content: ApiContent::Blocks(
                    content
                        .iter()
                        .map(|block| match block {
                            ContentBlock::Text { text } => ApiBlock::Text { text: text.clone() },
                            ContentBlock::ToolUse { id, name, input } => ApiBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            },
                        })
                        .collect(),
                ),
            },
            // Tool results travel back to the model as a user message holding
            // one tool_result block per executed call.
            ConversationTurn::ToolResults { results } => ApiMessage {
                role: "user",
                content: ApiContent::Blocks(
                    results
                        .iter()
                        .map(|r| ApiBlock::ToolResult {
                            tool_use_id: r.tool_use_id.clone(),
                            content: r.content.clone(),
                            is_error: r.is_error,
                        })
                        .collect(),
                ),
            },
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolResultBlock;
    use serde_json::json;

    #[test]
    fn user_turn_serializes_as_plain_text() {
        let msg = ApiMessage::from(&ConversationTurn::User {
            text: "list my resource groups".to_string(),
        });
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            wire,
            json!({"role": "user", "content": "list my resource groups"})
        );
    }

    #[test]
    fn assistant_turn_keeps_block_order() {
        let msg = ApiMessage::from(&ConversationTurn::Assistant {
            content: vec![
                ContentBlock::Text {
                    text: "Checking now.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "tu_1".to_string(),
                    name: "run_cli".to_string(),
                    input: json!({"command": "group list"}),
                },
            ],
        });
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][1]["type"], "tool_use");
        assert_eq!(wire["content"][1]["id"], "tu_1");
    }

    #[test]
    fn tool_results_travel_as_user_message() {
        let msg = ApiMessage::from(&ConversationTurn::ToolResults {
            results: vec![ToolResultBlock {
                tool_use_id: "tu_1".to_string(),
                content: "ok".to_string(),
                is_error: false,
            }],
        });
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["type"], "tool_result");
        assert_eq!(wire["content"][0]["tool_use_id"], "tu_1");
        assert_eq!(wire["content"][0]["is_error"], false);
    }

    #[test]
    fn response_blocks_decode_both_kinds() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Running the command."},
                {"type": "tool_use", "id": "tu_9", "name": "run_cli",
                 "input": {"command": "vm list"}}
            ],
            "stop_reason": "tool_use"
        });
        let decoded: MessagesResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded.content.len(), 2);
        assert!(matches!(
            &decoded.content[1],
            ContentBlock::ToolUse { name, .. } if name == "run_cli"
        ));
        assert_eq!(decoded.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn error_body_summary_extracts_message() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(summarize_error_body(body), "Overloaded");
        assert_eq!(
            summarize_error_body("<html>gateway timeout</html>"),
            "upstream rejected the request"
        );
    }
}
