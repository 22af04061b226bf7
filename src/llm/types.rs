//! Conversation data model and the model-gateway seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One content block of an assistant message.
///
/// Exhaustively matched everywhere it is consumed; adding a variant forces
/// every call site to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Result of one tool invocation, correlated to its originating
/// [`ContentBlock::ToolUse`] by `tool_use_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// One entry in a conversation's append-only turn log.
///
/// Turns are only ever appended; the sole removal path is deleting the whole
/// conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationTurn {
    /// A user message.
    User { text: String },
    /// An assistant message, possibly mixing text and tool-use blocks.
    Assistant { content: Vec<ContentBlock> },
    /// All tool results produced by one loop iteration, as a single bundle.
    ToolResults { results: Vec<ToolResultBlock> },
}

/// A model completion: ordered content blocks.
///
/// There is no explicit "more tool calls follow" flag; the absence of
/// tool-use blocks is the completion signal.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl ModelResponse {
    /// Split the content into text and tool-use blocks, preserving the
    /// original within-response order inside each partition.
    pub fn partition(&self) -> (Vec<&str>, Vec<(&str, &str, &Value)>) {
        let mut texts = Vec::new();
        let mut tool_uses = Vec::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => texts.push(text.as_str()),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_uses.push((id.as_str(), name.as_str(), input));
                }
            }
        }
        (texts, tool_uses)
    }
}

/// Declaration of one invocable tool, passed through to the model verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Opaque JSON schema document; never inspected, never rewritten.
    pub input_schema: Value,
}

/// Failure of a single gateway round trip.
///
/// Gateway failures are fatal to the run in progress: the loop does not retry
/// a model call, because the model may already have committed to a tool
/// decision that a silent replay would duplicate.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream_unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream_status {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("upstream_decode: {0}")]
    Decode(String),
}

/// One stateless completion round trip to the LLM backend.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, GatewayError>;
}
