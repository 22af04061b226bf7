//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{Exchange, SessionSummary};

/// Request to submit a chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// The user message. Validated non-empty before anything else runs.
    pub message: Option<String>,

    /// Conversation to continue; a fresh id is generated if not specified.
    pub conversation_id: Option<String>,
}

/// Response after a completed chat run.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    /// Final assistant text (all text blocks, newline-joined)
    pub response: String,

    /// Conversation this exchange belongs to
    pub conversation_id: String,

    /// Identifier of this exchange, `{conversation_id}_{message_count}`
    pub message_id: String,
}

/// One conversation's full history.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub messages: Vec<Exchange>,
}

/// All conversations, most recent first.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<SessionSummary>,
    pub total_count: usize,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub mcp_connected: bool,
}

/// Tool-session connectivity details for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct McpStatus {
    pub connected: bool,
    pub tool_count: usize,
}

/// Detailed system status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub active_sessions: usize,
    pub total_messages: usize,
    pub mcp: McpStatus,
    pub history_file: Option<String>,
    pub history_file_exists: bool,
}
